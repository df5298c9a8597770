//! Tree-walking evaluator over `serde_json::Value` data.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use super::functions::{Helper, display, truthy, type_name};
use super::parser::{Command, Node, Operand, ParsedTemplate, Pipeline};

/// Nested `{{template}}` calls allowed before rendering aborts.
const MAX_DEPTH: usize = 100;

#[derive(Debug)]
pub(crate) struct Compiled {
    pub(crate) parsed: ParsedTemplate,
}

pub(crate) type Registry = BTreeMap<String, Arc<Compiled>>;

#[derive(Debug, PartialEq)]
pub(crate) enum RenderError {
    NotFound(String),
    Cycle(String),
    Failed(String),
}

type Scope<'a> = HashMap<&'a str, &'a [Node]>;
type Result<T> = std::result::Result<T, RenderError>;

/// Renders the template registered as `name`.
pub(crate) fn render(registry: &Registry, name: &str, data: &Value) -> Result<String> {
    let mut exec = Exec {
        registry,
        out: String::new(),
        depth: 0,
    };
    exec.run_named(name, data.clone())?;
    Ok(exec.out)
}

/// Renders a parsed source that was never registered. It may still extend
/// or call registered templates.
pub(crate) fn render_detached<'a>(
    registry: &'a Registry,
    compiled: &'a Compiled,
    data: &Value,
) -> Result<String> {
    let mut chain: Vec<&'a Compiled> = vec![compiled];
    if let Some(parent) = &compiled.parsed.extends {
        let ancestors = resolve_chain(registry, parent).map_err(|e| match e {
            RenderError::NotFound(missing) => {
                RenderError::Failed(format!("parent template not found: {}", missing))
            }
            other => other,
        })?;
        chain.extend(ancestors);
    }
    let scope = scope_for(&chain);
    let base = chain.last().copied().unwrap_or(compiled);

    let mut exec = Exec {
        registry,
        out: String::new(),
        depth: 0,
    };
    let mut frame = Frame::new(data.clone());
    exec.walk(&base.parsed.root, data, &mut frame, &scope)?;
    Ok(exec.out)
}

/// Renders a single block declared by (or inherited into) `name`.
pub(crate) fn render_block(
    registry: &Registry,
    name: &str,
    block: &str,
    data: &Value,
) -> Result<String> {
    let chain = resolve_chain(registry, name)?;
    let scope = scope_for(&chain);
    let body = scope
        .get(block)
        .copied()
        .ok_or_else(|| RenderError::NotFound(format!("{}/{}", name, block)))?;

    let mut exec = Exec {
        registry,
        out: String::new(),
        depth: 0,
    };
    let mut frame = Frame::new(data.clone());
    exec.walk(body, data, &mut frame, &scope)?;
    Ok(exec.out)
}

/// Follows `extends` links from `name` to the root ancestor. The returned
/// chain starts with `name` itself.
fn resolve_chain<'a>(registry: &'a Registry, name: &str) -> Result<Vec<&'a Compiled>> {
    let mut chain: Vec<&'a Compiled> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut current = name.to_string();

    loop {
        if seen.contains(&current) {
            seen.push(current);
            return Err(RenderError::Cycle(seen.join(" -> ")));
        }
        let Some(compiled) = registry.get(&current) else {
            return Err(if chain.is_empty() {
                RenderError::NotFound(current)
            } else {
                RenderError::Failed(format!("parent template not found: {}", current))
            });
        };
        chain.push(compiled.as_ref());
        seen.push(current);
        match &compiled.parsed.extends {
            Some(parent) => current = parent.clone(),
            None => return Ok(chain),
        }
    }
}

/// Merges block declarations along a chain; the innermost child wins.
fn scope_for<'a>(chain: &[&'a Compiled]) -> Scope<'a> {
    let mut scope = Scope::new();
    for compiled in chain.iter().rev() {
        for (name, body) in &compiled.parsed.defines {
            scope.insert(name.as_str(), body.as_slice());
        }
    }
    scope
}

struct Frame {
    vars: Vec<(String, Value)>,
}

impl Frame {
    fn new(root: Value) -> Self {
        Self {
            vars: vec![(String::new(), root)],
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars
            .iter()
            .rev()
            .find(|(var, _)| var == name)
            .map(|(_, value)| value)
    }
}

struct Exec<'a> {
    registry: &'a Registry,
    out: String,
    depth: usize,
}

impl<'a> Exec<'a> {
    fn run_named(&mut self, name: &str, dot: Value) -> Result<()> {
        let chain = resolve_chain(self.registry, name)?;
        let scope = scope_for(&chain);
        let Some(base) = chain.last() else {
            return Err(RenderError::NotFound(name.to_string()));
        };

        let mut frame = Frame::new(dot.clone());
        self.walk(&base.parsed.root, &dot, &mut frame, &scope)
    }

    fn walk(&mut self, nodes: &[Node], dot: &Value, frame: &mut Frame, scope: &Scope<'a>) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::Action(pipe) => {
                    let value = self.eval_pipeline(pipe, dot, frame, scope)?;
                    if pipe.decl.is_empty() {
                        self.out.push_str(&display(&value));
                    }
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mark = frame.vars.len();
                    let mut taken = false;
                    for (pipe, body) in branches {
                        let condition = self.eval_pipeline(pipe, dot, frame, scope)?;
                        if truthy(&condition) {
                            self.walk(body, dot, frame, scope)?;
                            taken = true;
                            break;
                        }
                    }
                    if !taken {
                        self.walk(otherwise, dot, frame, scope)?;
                    }
                    frame.vars.truncate(mark);
                }
                Node::Range {
                    pipe,
                    body,
                    otherwise,
                } => self.walk_range(pipe, body, otherwise, dot, frame, scope)?,
                Node::With {
                    pipe,
                    body,
                    otherwise,
                } => {
                    let mark = frame.vars.len();
                    let value = self.eval_pipeline(pipe, dot, frame, scope)?;
                    if truthy(&value) {
                        self.walk(body, &value, frame, scope)?;
                    } else {
                        self.walk(otherwise, dot, frame, scope)?;
                    }
                    frame.vars.truncate(mark);
                }
                Node::Template { name, pipe } => {
                    let value = match pipe {
                        Some(pipe) => self.eval_pipeline(pipe, dot, frame, scope)?,
                        None => Value::Null,
                    };
                    self.call_template(name, value, scope)?;
                }
            }
        }
        Ok(())
    }

    fn walk_range(
        &mut self,
        pipe: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
    ) -> Result<()> {
        let collection = self.eval_commands(&pipe.commands, dot, frame, scope)?;
        let items: Vec<(Value, Value)> = match collection {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::from(i), v))
                .collect(),
            // Map keys iterate in sorted order.
            Value::Object(map) => map.into_iter().map(|(k, v)| (Value::String(k), v)).collect(),
            Value::Null => Vec::new(),
            Value::Number(n) if n.as_u64().is_some() => (0..n.as_u64().unwrap_or(0))
                .map(|i| (Value::from(i), Value::from(i)))
                .collect(),
            other => {
                return Err(RenderError::Failed(format!(
                    "range can't iterate over {}",
                    type_name(&other)
                )));
            }
        };

        if items.is_empty() {
            return self.walk(otherwise, dot, frame, scope);
        }

        for (key, value) in items {
            let mark = frame.vars.len();
            match pipe.decl.as_slice() {
                [single] => frame.vars.push((single.clone(), value.clone())),
                [k, v] => {
                    frame.vars.push((k.clone(), key));
                    frame.vars.push((v.clone(), value.clone()));
                }
                _ => {}
            }
            let result = self.walk(body, &value, frame, scope);
            frame.vars.truncate(mark);
            result?;
        }
        Ok(())
    }

    fn call_template(&mut self, name: &str, dot: Value, scope: &Scope<'a>) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(RenderError::Failed(format!(
                "exceeded maximum template depth ({}) calling {:?}",
                MAX_DEPTH, name
            )));
        }
        self.depth += 1;

        let registry: &'a Registry = self.registry;
        let result = if let Some(body) = scope.get(name).copied() {
            let mut frame = Frame::new(dot.clone());
            self.walk(body, &dot, &mut frame, scope)
        } else if registry.contains_key(name) {
            self.run_named(name, dot).map_err(|e| match e {
                RenderError::NotFound(missing) => {
                    RenderError::Failed(format!("no such template {:?}", missing))
                }
                other => other,
            })
        } else if let Some(owner) = registry
            .values()
            .find(|compiled| compiled.parsed.defines.contains_key(name))
        {
            // A block declared inside some other registered template.
            let owner_scope: Scope<'a> = owner
                .parsed
                .defines
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_slice()))
                .collect();
            match owner_scope.get(name).copied() {
                Some(body) => {
                    let mut frame = Frame::new(dot.clone());
                    self.walk(body, &dot, &mut frame, &owner_scope)
                }
                None => Err(RenderError::Failed(format!("no such template {:?}", name))),
            }
        } else {
            Err(RenderError::Failed(format!("no such template {:?}", name)))
        };

        self.depth -= 1;
        result
    }

    fn eval_pipeline(
        &mut self,
        pipe: &Pipeline,
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
    ) -> Result<Value> {
        let value = self.eval_commands(&pipe.commands, dot, frame, scope)?;

        if let Some(name) = pipe.decl.first() {
            if pipe.assign {
                let slot = frame
                    .vars
                    .iter_mut()
                    .rev()
                    .find(|(var, _)| var == name)
                    .ok_or_else(|| RenderError::Failed(format!("undefined variable: ${}", name)))?;
                slot.1 = value.clone();
            } else {
                frame.vars.push((name.clone(), value.clone()));
            }
        }
        Ok(value)
    }

    fn eval_commands(
        &mut self,
        commands: &[Command],
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
    ) -> Result<Value> {
        let mut piped: Option<Value> = None;
        for command in commands {
            piped = Some(self.eval_command(command, dot, frame, scope, piped)?);
        }
        Ok(piped.unwrap_or(Value::Null))
    }

    fn eval_command(
        &mut self,
        command: &Command,
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
        piped: Option<Value>,
    ) -> Result<Value> {
        let (first, rest) = match command.operands.split_first() {
            Some(parts) => parts,
            None => return Ok(Value::Null),
        };

        let Operand::Func(helper) = first else {
            if piped.is_some() {
                return Err(RenderError::Failed(
                    "can't give argument to non-function".to_string(),
                ));
            }
            return self.eval_operand(first, dot, frame, scope);
        };

        if matches!(helper, Helper::And | Helper::Or) {
            return self.eval_short_circuit(*helper, rest, piped, dot, frame, scope);
        }

        let mut args = Vec::with_capacity(rest.len() + 1);
        for operand in rest {
            args.push(self.eval_operand(operand, dot, frame, scope)?);
        }
        if let Some(value) = piped {
            args.push(value);
        }
        helper
            .call(args)
            .map_err(|e| RenderError::Failed(format!("error calling {}: {}", helper.name(), e)))
    }

    fn eval_short_circuit(
        &mut self,
        helper: Helper,
        operands: &[Operand],
        piped: Option<Value>,
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
    ) -> Result<Value> {
        let total = operands.len() + usize::from(piped.is_some());
        if total == 0 {
            return Err(RenderError::Failed(format!(
                "wrong number of args for {}: got 0",
                helper.name()
            )));
        }

        let mut last = Value::Null;
        for operand in operands {
            last = self.eval_operand(operand, dot, frame, scope)?;
            if truthy(&last) == (helper == Helper::Or) {
                return Ok(last);
            }
        }
        if let Some(value) = piped {
            last = value;
        }
        Ok(last)
    }

    fn eval_operand(
        &mut self,
        operand: &Operand,
        dot: &Value,
        frame: &mut Frame,
        scope: &Scope<'a>,
    ) -> Result<Value> {
        match operand {
            Operand::Func(helper) => helper
                .call(Vec::new())
                .map_err(|e| RenderError::Failed(format!("error calling {}: {}", helper.name(), e))),
            Operand::Field(path) => field(dot, path),
            Operand::Variable(name, path) => {
                let value = frame
                    .lookup(name)
                    .ok_or_else(|| RenderError::Failed(format!("undefined variable: ${}", name)))?;
                field(value, path)
            }
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Sub(pipe) => self.eval_commands(&pipe.commands, dot, frame, scope),
            Operand::Chain(inner, path) => {
                let value = self.eval_operand(inner, dot, frame, scope)?;
                field(&value, path)
            }
        }
    }
}

/// Walks a field path. Missing map keys resolve to nil and render empty.
fn field(value: &Value, path: &[String]) -> Result<Value> {
    let mut current = value;
    for key in path {
        current = match current {
            Value::Object(map) => match map.get(key) {
                Some(next) => next,
                None => return Ok(Value::Null),
            },
            Value::Null => return Ok(Value::Null),
            other => {
                return Err(RenderError::Failed(format!(
                    "can't evaluate field {} in type {}",
                    key,
                    type_name(other)
                )));
            }
        };
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parser::parse;
    use serde_json::json;

    fn registry(entries: &[(&str, &str)]) -> Registry {
        entries
            .iter()
            .map(|(name, source)| {
                (
                    name.to_string(),
                    Arc::new(Compiled {
                        parsed: parse(source).unwrap(),
                    }),
                )
            })
            .collect()
    }

    fn run(source: &str, data: Value) -> String {
        render(&registry(&[("t", source)]), "t", &data).unwrap()
    }

    #[test]
    fn test_fields_and_missing_keys() {
        let data = json!({"A": {"B": "x"}});
        assert_eq!(run("{{.A.B}}|{{.A.Missing}}|{{.Nope.Deeper}}", data), "x||");
        assert!(render(&registry(&[("t", "{{.A.B}}")]), "t", &json!({"A": "s"})).is_err());
    }

    #[test]
    fn test_conditionals() {
        let src = "{{if eq .env \"prod\"}}P{{else if eq .env \"stage\"}}S{{else}}D{{end}}";
        assert_eq!(run(src, json!({"env": "prod"})), "P");
        assert_eq!(run(src, json!({"env": "stage"})), "S");
        assert_eq!(run(src, json!({})), "D");
    }

    #[test]
    fn test_range_and_variables() {
        let data = json!({"items": ["a", "b"], "map": {"y": 2, "x": 1}});
        assert_eq!(
            run("{{range $i, $v := .items}}{{$i}}:{{$v}};{{end}}", data.clone()),
            "0:a;1:b;"
        );
        assert_eq!(run("{{range $k, $v := .map}}{{$k}}={{$v}} {{end}}", data.clone()), "x=1 y=2 ");
        assert_eq!(run("{{range .none}}x{{else}}empty{{end}}", data.clone()), "empty");
        assert_eq!(run("{{$x := \"a\"}}{{$x = \"b\"}}{{$x}}", data.clone()), "b");
        assert_eq!(run("{{range .items}}{{$.map.x}}{{.}}{{end}}", data), "1a1b");
    }

    #[test]
    fn test_with_and_pipes() {
        let data = json!({"name": "cron", "empty": ""});
        assert_eq!(run("{{with .name}}{{. | upper}}{{end}}", data.clone()), "CRON");
        assert_eq!(run("{{with .empty}}x{{else}}none{{end}}", data.clone()), "none");
        assert_eq!(run("{{.name | printf \"%s!\"}}", data), "cron!");
    }

    #[test]
    fn test_short_circuit_skips_failing_operand() {
        // `index` on a missing list would fail if it were evaluated.
        assert_eq!(run("{{and false (index .list 5)}}", json!({"list": []})), "false");
        assert_eq!(run("{{or \"x\" (index .list 5)}}", json!({"list": []})), "x");
    }

    #[test]
    fn test_template_calls_and_depth() {
        let reg = registry(&[
            ("header", "H({{.}})"),
            ("page", "{{template \"header\" .title}}{{define \"x\"}}X{{end}}{{template \"x\"}}"),
            ("loop", "{{template \"loop\" .}}"),
        ]);
        assert_eq!(render(&reg, "page", &json!({"title": "T"})).unwrap(), "H(T)X");
        assert!(matches!(
            render(&reg, "loop", &json!({})),
            Err(RenderError::Failed(msg)) if msg.contains("maximum template depth")
        ));
        assert!(matches!(render(&reg, "absent", &json!({})), Err(RenderError::NotFound(_))));
    }

    #[test]
    fn test_inheritance_chain() {
        let reg = registry(&[
            ("base", "<{{block \"title\" .}}Base{{end}}|{{block \"body\" .}}base body{{end}}|{{block \"foot\" .}}{{end}}>"),
            ("mid", "{{extends \"base\"}}{{define \"title\"}}Mid{{end}}{{define \"body\"}}mid body{{end}}"),
            ("leaf", "{{extends \"mid\"}}{{define \"title\"}}Leaf {{.n}}{{end}}"),
        ]);
        assert_eq!(render(&reg, "leaf", &json!({"n": 1})).unwrap(), "<Leaf 1|mid body|>");
        assert_eq!(render(&reg, "mid", &json!({})).unwrap(), "<Mid|mid body|>");
        assert_eq!(render_block(&reg, "leaf", "body", &json!({})).unwrap(), "mid body");
    }

    #[test]
    fn test_inheritance_cycle_and_missing_parent() {
        let reg = registry(&[
            ("a", "{{extends \"b\"}}"),
            ("b", "{{extends \"a\"}}"),
            ("orphan", "{{extends \"ghost\"}}"),
        ]);
        assert!(matches!(render(&reg, "a", &json!({})), Err(RenderError::Cycle(_))));
        assert!(matches!(
            render(&reg, "orphan", &json!({})),
            Err(RenderError::Failed(msg)) if msg.contains("ghost")
        ));
    }

    #[test]
    fn test_range_over_count() {
        assert_eq!(run("{{range 3}}{{.}}{{end}}", json!({})), "012");
        assert!(render(&registry(&[("t", "{{range .s}}{{end}}")]), "t", &json!({"s": "str"})).is_err());
    }
}
