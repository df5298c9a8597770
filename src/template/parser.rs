//! Builds the template syntax tree from lexed segments.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::functions::Helper;
use super::lexer::{self, Segment, Token};

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
    If {
        branches: Vec<(Pipeline, Vec<Node>)>,
        otherwise: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Template {
        name: String,
        pipe: Option<Pipeline>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    pub decl: Vec<String>,
    pub assign: bool,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone)]
pub(crate) enum Operand {
    Func(Helper),
    Field(Vec<String>),
    Variable(String, Vec<String>),
    Literal(Value),
    Sub(Box<Pipeline>),
    Chain(Box<Operand>, Vec<String>),
}

/// A parsed source: its top-level body, the blocks it declares, and the
/// parent it inherits from.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedTemplate {
    pub root: Vec<Node>,
    pub defines: HashMap<String, Vec<Node>>,
    pub extends: Option<String>,
}

pub(crate) fn parse(source: &str) -> Result<ParsedTemplate, String> {
    let segments = lexer::segments(source).map_err(|e| e.to_string())?;
    let mut parser = Parser {
        segments,
        pos: 0,
        line: 1,
        defines: HashMap::new(),
        explicit: HashSet::new(),
        extends: None,
    };
    let (root, stop) = parser.parse_list(0)?;
    debug_assert!(matches!(stop, Stop::Eof));
    Ok(ParsedTemplate {
        root,
        defines: parser.defines,
        extends: parser.extends,
    })
}

enum Stop {
    Eof,
    End,
    Else(Option<Pipeline>),
}

struct Parser {
    segments: Vec<Segment>,
    pos: usize,
    line: usize,
    defines: HashMap<String, Vec<Node>>,
    explicit: HashSet<String>,
    extends: Option<String>,
}

impl Parser {
    fn err(&self, message: impl std::fmt::Display) -> String {
        format!("line {}: {}", self.line, message)
    }

    fn parse_list(&mut self, depth: usize) -> Result<(Vec<Node>, Stop), String> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let segment = self.segments[self.pos].clone();
            self.pos += 1;

            let (tokens, line) = match segment {
                Segment::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Segment::Action { tokens, line } => (tokens, line),
            };
            self.line = line;

            let keyword = match &tokens[0] {
                Token::Ident(word) => word.as_str(),
                _ => "",
            };

            match keyword {
                "end" => {
                    if depth == 0 {
                        return Err(self.err("unexpected {{end}}"));
                    }
                    if tokens.len() != 1 {
                        return Err(self.err("unexpected arguments to end"));
                    }
                    return Ok((nodes, Stop::End));
                }
                "else" => {
                    if depth == 0 {
                        return Err(self.err("unexpected {{else}}"));
                    }
                    if tokens.len() == 1 {
                        return Ok((nodes, Stop::Else(None)));
                    }
                    if tokens[1] == Token::Ident("if".to_string()) {
                        let pipe = self.parse_pipeline(&tokens[2..], false)?;
                        return Ok((nodes, Stop::Else(Some(pipe))));
                    }
                    return Err(self.err("expected 'if' after else"));
                }
                "if" => nodes.push(self.parse_if(&tokens[1..], depth)?),
                "range" | "with" => {
                    let pipe = self.parse_pipeline(&tokens[1..], keyword == "range")?;
                    let (body, stop) = self.parse_list(depth + 1)?;
                    let otherwise = match stop {
                        Stop::End => Vec::new(),
                        Stop::Else(None) => self.parse_final_else(depth)?,
                        Stop::Else(Some(_)) => {
                            return Err(self.err(format!("else if is not allowed in {}", keyword)));
                        }
                        Stop::Eof => return Err(self.err("unexpected EOF")),
                    };
                    nodes.push(if keyword == "range" {
                        Node::Range {
                            pipe,
                            body,
                            otherwise,
                        }
                    } else {
                        Node::With {
                            pipe,
                            body,
                            otherwise,
                        }
                    });
                }
                "define" => {
                    if depth != 0 {
                        return Err(self.err("define is only allowed at the top level"));
                    }
                    let name = self.quoted_name(&tokens, "define")?;
                    if tokens.len() != 2 {
                        return Err(self.err("unexpected arguments to define"));
                    }
                    let body = self.parse_block_body(depth)?;
                    self.explicit.insert(name.clone());
                    self.defines.insert(name, body);
                }
                "block" => {
                    let name = self.quoted_name(&tokens, "block")?;
                    let pipe = if tokens.len() > 2 {
                        self.parse_pipeline(&tokens[2..], false)?
                    } else {
                        dot_pipeline()
                    };
                    let body = self.parse_block_body(depth)?;
                    if !self.explicit.contains(&name) {
                        self.defines.insert(name.clone(), body);
                    }
                    nodes.push(Node::Template {
                        name,
                        pipe: Some(pipe),
                    });
                }
                "template" => {
                    let name = self.quoted_name(&tokens, "template")?;
                    let pipe = if tokens.len() > 2 {
                        Some(self.parse_pipeline(&tokens[2..], false)?)
                    } else {
                        None
                    };
                    nodes.push(Node::Template { name, pipe });
                }
                "extends" => {
                    if depth != 0 {
                        return Err(self.err("extends is only allowed at the top level"));
                    }
                    let name = self.quoted_name(&tokens, "extends")?;
                    if tokens.len() != 2 {
                        return Err(self.err("unexpected arguments to extends"));
                    }
                    if self.extends.replace(name).is_some() {
                        return Err(self.err("multiple extends directives"));
                    }
                }
                _ => nodes.push(Node::Action(self.parse_pipeline(&tokens, false)?)),
            }
        }

        if depth > 0 {
            return Err(self.err("unexpected EOF"));
        }
        Ok((nodes, Stop::Eof))
    }

    fn parse_if(&mut self, tokens: &[Token], depth: usize) -> Result<Node, String> {
        let mut branches = Vec::new();
        let mut pipe = self.parse_pipeline(tokens, false)?;

        loop {
            let (body, stop) = self.parse_list(depth + 1)?;
            branches.push((pipe, body));
            match stop {
                Stop::End => {
                    return Ok(Node::If {
                        branches,
                        otherwise: Vec::new(),
                    });
                }
                Stop::Else(None) => {
                    let otherwise = self.parse_final_else(depth)?;
                    return Ok(Node::If {
                        branches,
                        otherwise,
                    });
                }
                Stop::Else(Some(next)) => pipe = next,
                Stop::Eof => return Err(self.err("unexpected EOF")),
            }
        }
    }

    fn parse_final_else(&mut self, depth: usize) -> Result<Vec<Node>, String> {
        let (body, stop) = self.parse_list(depth + 1)?;
        match stop {
            Stop::End => Ok(body),
            Stop::Else(_) => Err(self.err("else after else")),
            Stop::Eof => Err(self.err("unexpected EOF")),
        }
    }

    fn parse_block_body(&mut self, depth: usize) -> Result<Vec<Node>, String> {
        let (body, stop) = self.parse_list(depth + 1)?;
        match stop {
            Stop::End => Ok(body),
            Stop::Else(_) => Err(self.err("unexpected {{else}}")),
            Stop::Eof => Err(self.err("unexpected EOF")),
        }
    }

    fn quoted_name(&self, tokens: &[Token], keyword: &str) -> Result<String, String> {
        match tokens.get(1) {
            Some(Token::Str(name)) => Ok(name.clone()),
            _ => Err(self.err(format!("{} requires a quoted template name", keyword))),
        }
    }

    fn parse_pipeline(&self, tokens: &[Token], allow_pair: bool) -> Result<Pipeline, String> {
        let (decl, assign, rest) = split_declaration(tokens);
        if decl.len() > 1 && !allow_pair {
            return Err(self.err("too many declarations"));
        }

        let mut idx = 0;
        let commands = self.parse_commands(rest, &mut idx, false)?;
        if idx != rest.len() {
            return Err(self.err("unexpected tokens after pipeline"));
        }
        Ok(Pipeline {
            decl,
            assign,
            commands,
        })
    }

    fn parse_commands(
        &self,
        tokens: &[Token],
        idx: &mut usize,
        in_paren: bool,
    ) -> Result<Vec<Command>, String> {
        let mut commands = Vec::new();
        loop {
            let mut operands = Vec::new();
            while let Some(token) = tokens.get(*idx) {
                if matches!(token, Token::Pipe | Token::RParen) {
                    break;
                }
                operands.push(self.parse_operand(tokens, idx)?);
            }

            if operands.is_empty() {
                return Err(self.err("missing value for command"));
            }
            let is_func = matches!(operands[0], Operand::Func(_));
            if !is_func && operands.len() > 1 {
                return Err(self.err("can't give argument to non-function"));
            }
            if !is_func && !commands.is_empty() {
                return Err(self.err(format!(
                    "non executable command in pipeline stage {}",
                    commands.len() + 1
                )));
            }
            commands.push(Command { operands });

            match tokens.get(*idx) {
                Some(Token::Pipe) => *idx += 1,
                Some(Token::RParen) if in_paren => {
                    *idx += 1;
                    return Ok(commands);
                }
                Some(Token::RParen) => return Err(self.err("unexpected right paren")),
                None if in_paren => return Err(self.err("unclosed left paren")),
                None => return Ok(commands),
                Some(_) => return Err(self.err("unexpected token in pipeline")),
            }
        }
    }

    fn parse_operand(&self, tokens: &[Token], idx: &mut usize) -> Result<Operand, String> {
        let token = tokens[*idx].clone();
        *idx += 1;
        Ok(match token {
            Token::Ident(name) => match Helper::lookup(&name) {
                Some(helper) => Operand::Func(helper),
                None => return Err(self.err(format!("function {:?} not defined", name))),
            },
            Token::Field(path) => Operand::Field(path),
            Token::Variable(name, path) => Operand::Variable(name, path),
            Token::Str(value) => Operand::Literal(Value::String(value)),
            Token::Number(value) => Operand::Literal(Value::Number(value)),
            Token::Bool(value) => Operand::Literal(Value::Bool(value)),
            Token::Nil => Operand::Literal(Value::Null),
            Token::LParen => {
                let commands = self.parse_commands(tokens, idx, true)?;
                let sub = Operand::Sub(Box::new(Pipeline {
                    decl: Vec::new(),
                    assign: false,
                    commands,
                }));
                if let Some(Token::Chain(path)) = tokens.get(*idx) {
                    *idx += 1;
                    Operand::Chain(Box::new(sub), path.clone())
                } else {
                    sub
                }
            }
            other => return Err(self.err(format!("unexpected {:?} in operand", other))),
        })
    }
}

fn split_declaration(tokens: &[Token]) -> (Vec<String>, bool, &[Token]) {
    match tokens {
        [Token::Variable(name, path), Token::Declare, rest @ ..] if path.is_empty() => {
            (vec![name.clone()], false, rest)
        }
        [Token::Variable(name, path), Token::Assign, rest @ ..] if path.is_empty() => {
            (vec![name.clone()], true, rest)
        }
        [
            Token::Variable(first, p1),
            Token::Comma,
            Token::Variable(second, p2),
            Token::Declare,
            rest @ ..,
        ] if p1.is_empty() && p2.is_empty() => (vec![first.clone(), second.clone()], false, rest),
        _ => (Vec::new(), false, tokens),
    }
}

fn dot_pipeline() -> Pipeline {
    Pipeline {
        decl: Vec::new(),
        assign: false,
        commands: vec![Command {
            operands: vec![Operand::Field(Vec::new())],
        }],
    }
}
