//! Built-in templates registered by every `TemplateManager`.

pub(crate) const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("default_console", CONSOLE),
    ("default_email_subject", EMAIL_SUBJECT),
    ("default_email_html", EMAIL_HTML),
    ("default_email_text", EMAIL_TEXT),
    ("default_slack", SLACK),
    ("default_slack_monitoring", SLACK_MONITORING),
    ("default_webhook", WEBHOOK),
    ("default_webhook_teams", WEBHOOK_TEAMS),
    ("default_file_content", FILE_CONTENT),
    ("default_file_filename", FILE_FILENAME),
    ("default_github_issue", GITHUB_ISSUE),
    ("default_github_issue_title", GITHUB_ISSUE_TITLE),
    ("default_github_comment", GITHUB_COMMENT),
    ("default_github_pr", GITHUB_PR),
    ("default_github_pr_title", GITHUB_PR_TITLE),
];

const CONSOLE: &str = r#"==========================================================
AI Response: {{.PromptName}}
==========================================================
Model: {{.Model}}
Time: {{formatDate .Timestamp "%Y-%m-%d %H:%M:%S"}}
==========================================================

{{.Content}}

=========================================================="#;

const EMAIL_SUBJECT: &str = "Response from {{.Model}} - {{.PromptName}}";

const EMAIL_HTML: &str = r#"<html>
<body>
<h1>AI Response: {{.PromptName}}</h1>
<p><strong>Model:</strong> {{.Model}}</p>
<p><strong>Time:</strong> {{formatDate .Timestamp "Jan 02, 2006 15:04:05"}}</p>
<div>
{{.Content}}
</div>
</body>
</html>
"#;

const EMAIL_TEXT: &str = r#"AI Response: {{.PromptName}}
Model: {{.Model}}
Time: {{formatDate .Timestamp "Jan 02, 2006 15:04:05"}}

{{.Content}}
"#;

const SLACK: &str = r#"{"blocks":[{"type":"header","text":{"type":"plain_text","text":{{json (printf "AI Response: %s" .PromptName)}}}},{"type":"section","fields":[{"type":"mrkdwn","text":{{json (printf "*Model:* %s" .Model)}}},{"type":"mrkdwn","text":{{json (printf "*Time:* %s" .Timestamp)}}}]},{"type":"section","text":{"type":"mrkdwn","text":{{json .Content}}}}]}"#;

const SLACK_MONITORING: &str = r#"{"text":{{json (printf "Monitoring report: %s" .PromptName)}},"attachments":[{"color":"{{if or (contains (lower .Content) "critical") (contains (lower .Content) "error")}}danger{{else if contains (lower .Content) "warning"}}warning{{else}}good{{end}}","title":{{json (printf "%s (%s)" .PromptName .Model)}},"text":{{json .Content}},"footer":{{json (printf "cronai %s" .ExecutionID)}},"ts_text":{{json .Timestamp}}}]}"#;

const WEBHOOK: &str = r#"{"timestamp":{{json .Timestamp}},"model":{{json .Model}},"prompt":{{json .PromptName}},"execution_id":{{json .ExecutionID}},"content":{{json .Content}},"variables":{{json .Variables}}}"#;

const WEBHOOK_TEAMS: &str = r#"{"@type":"MessageCard","@context":"https://schema.org/extensions","summary":{{json (printf "AI Response: %s" .PromptName)}},"themeColor":"0076D7","title":{{json (printf "AI Response: %s" .PromptName)}},"sections":[{"activityTitle":{{json (printf "Model: %s" .Model)}},"activitySubtitle":{{json .Timestamp}},"facts":[{"name":"Prompt","value":{{json .PromptName}}},{"name":"Execution","value":{{json .ExecutionID}}}],"text":{{json .Content}}}]}"#;

const FILE_CONTENT: &str = r#"# AI Response: {{.PromptName}}
Model: {{.Model}}
Time: {{.Timestamp}}

{{.Content}}
"#;

const FILE_FILENAME: &str = r#"{{.Model}}-{{formatDate .Timestamp "%Y%m%d-%H%M%S"}}.txt"#;

const GITHUB_ISSUE: &str = r#"{"title":{{json (printf "AI Response: %s" .PromptName)}},"body":{{json .Content}},"labels":["auto-generated","cronai"]}"#;

const GITHUB_ISSUE_TITLE: &str = "AI Response: {{.PromptName}} ({{.Model}})";

const GITHUB_COMMENT: &str = r#"{"body":{{json .Content}}}"#;

const GITHUB_PR: &str = r#"{"title":{{json (printf "AI Response: %s" .PromptName)}},"body":{{json .Content}},"head":{{json (getVar .Variables "head_branch" "")}},"base":{{json (getVar .Variables "base_branch" "main")}}}"#;

const GITHUB_PR_TITLE: &str = "AI update: {{.PromptName}}";
