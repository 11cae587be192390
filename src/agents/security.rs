//! Security analysis agent.
//!
//! Three local passes and one targeted LLM pass: a regex catalog over a
//! fixed set of vulnerability classes, sensitive-file detection by name,
//! secret heuristics over configuration files, and LLM review of files
//! whose paths suggest authentication, security, or cryptography concerns.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agents::llm::ChatClient;
use crate::agents::orchestrator::{AgentContext, AgentOutcome, AnalysisAgent};
use crate::agents::parse::parse_findings;
use crate::core::entities::AgentFinding;
use crate::core::errors::Result;
use crate::ingest::archive::read_text_lossy;

/// Upper bound on files handed to the targeted LLM pass.
const MAX_LLM_FILES: usize = 5;

/// Upper bound on characters of one file sent to the LLM.
const MAX_LLM_CHARS: usize = 8_000;

struct VulnPattern {
    name: &'static str,
    severity: &'static str,
    regex: Regex,
    fix: &'static str,
}

static PATTERNS: Lazy<Vec<VulnPattern>> = Lazy::new(|| {
    let pattern = |name, severity, expr, fix| VulnPattern {
        name,
        severity,
        regex: Regex::new(expr).expect("static security pattern must compile"),
        fix,
    };

    vec![
        pattern(
            "Possible SQL injection",
            "High",
            r#"(?i)(select|insert|update|delete)\s.{0,80}?("\s*\+|'\s*\+|\$\{|%s|\{0\})"#,
            "Use parameterized queries instead of string concatenation.",
        ),
        pattern(
            "Hardcoded secret",
            "High",
            r#"(?i)(password|passwd|secret|api[_-]?key|access[_-]?token)\s*[:=]\s*["'][^"'\s]{6,}["']"#,
            "Move the secret into the environment or a secret manager.",
        ),
        pattern(
            "Weak cryptographic primitive",
            "Medium",
            r"(?i)\b(md5|sha-?1|\bdes\b|rc4)\b",
            "Use a modern algorithm such as SHA-256 or an AEAD cipher.",
        ),
        pattern(
            "Insecure randomness for security purposes",
            "Medium",
            r"(?i)(math\.random\s*\(|new Random\s*\(|random\.random\s*\(|rand\s*\(\s*\))",
            "Use a cryptographically secure random source for tokens and keys.",
        ),
        pattern(
            "Potential path traversal",
            "High",
            r#"(?i)(open|read|load|include|file)[^\n]{0,60}\.\./"#,
            "Normalize and validate paths against an allow-listed root.",
        ),
        pattern(
            "Potential command injection",
            "High",
            r#"(?i)(system|popen|shell_exec|process\.start|exec)\s*\([^\n)]*(\+|\$\{|%s)"#,
            "Pass arguments as a vector and never interpolate user input into commands.",
        ),
        pattern(
            "Possible cross-site scripting sink",
            "Medium",
            r"(?i)(innerhtml\s*=|document\.write\s*\(|dangerouslysetinnerhtml)",
            "Escape or sanitize user-controlled data before it reaches the DOM.",
        ),
        pattern(
            "Insecure deserialization",
            "High",
            r"(?i)(pickle\.loads|binaryformatter|objectinputstream|yaml\.load\s*\()",
            "Deserialize with a safe loader or a schema-validated format.",
        ),
        pattern(
            "Leftover debug code",
            "Low",
            r"(?i)(debugger;|console\.debug\s*\(|set_trace\s*\(\))",
            "Remove debug statements before shipping.",
        ),
        pattern(
            "TLS verification disabled",
            "High",
            r"(?i)(verify\s*=\s*false|insecureskipverify|rejectunauthorized\s*:\s*false|danger_accept_invalid_certs|servercertificatevalidationcallback)",
            "Never disable certificate validation outside a test harness.",
        ),
        pattern(
            "Endpoint exposed without authentication",
            "Medium",
            r#"(?i)(\[allowanonymous\]|app\.(get|post|put|delete)\s*\(\s*["']/(admin|debug|internal))"#,
            "Require authentication on administrative and internal endpoints.",
        ),
    ]
});

static SENSITIVE_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\.pem|\.key|\.pfx)$|(^|/)(id_rsa|\.env|secrets\.json)$|(^|/)appsettings\.[^/]+\.json$")
        .expect("static sensitive-file pattern must compile")
});

static CONFIG_SECRET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)"?(password|secret|connectionstring|apikey|api_key)"?\s*[:=]\s*"?[^"\s]{6,}"#)
        .expect("static config-secret pattern must compile")
});

static SECURITY_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(auth|security|crypto|login|token|password|secret)")
        .expect("static security-path pattern must compile")
});

const CONFIG_EXTENSIONS: &[&str] = &[".json", ".yaml", ".yml", ".xml", ".config", ".toml", ""];

/// Pattern-driven security agent with a targeted LLM pass.
pub struct SecurityAgent {
    chat: Arc<dyn ChatClient>,
}

impl SecurityAgent {
    /// Create the agent over a chat client.
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }

    fn scan_source(&self, relative_path: &str, content: &str, findings: &mut Vec<AgentFinding>) {
        for pattern in PATTERNS.iter() {
            // One finding per pattern per file keeps the report readable.
            let mut matched_line = None;
            for (line_number, line) in content.lines().enumerate() {
                if pattern.regex.is_match(line) {
                    matched_line = Some(line_number + 1);
                    break;
                }
            }
            if let Some(line) = matched_line {
                findings.push(AgentFinding {
                    id: Some(Uuid::new_v4()),
                    file_path: Some(relative_path.to_string()),
                    start_line: Some(line),
                    end_line: Some(line),
                    category: "Security".to_string(),
                    severity: pattern.severity.to_string(),
                    description: pattern.name.to_string(),
                    explanation: format!("Matched at {relative_path}:{line}."),
                    suggested_fix: pattern.fix.to_string(),
                    confidence: 0.7,
                    ..AgentFinding::default()
                });
            }
        }
    }

    fn scan_config(&self, relative_path: &str, content: &str, findings: &mut Vec<AgentFinding>) {
        for (line_number, line) in content.lines().enumerate() {
            if CONFIG_SECRET.is_match(line)
                && !line.contains("${")
                && !line.to_ascii_lowercase().contains("example")
                && !line.to_ascii_lowercase().contains("changeme")
            {
                findings.push(AgentFinding {
                    id: Some(Uuid::new_v4()),
                    file_path: Some(relative_path.to_string()),
                    start_line: Some(line_number + 1),
                    end_line: Some(line_number + 1),
                    category: "Security".to_string(),
                    severity: "High".to_string(),
                    description: "Credential-like value in configuration".to_string(),
                    explanation: format!(
                        "A secret-shaped key in {relative_path} carries an inline value."
                    ),
                    suggested_fix: "Reference the environment or a secret store instead."
                        .to_string(),
                    confidence: 0.6,
                    ..AgentFinding::default()
                });
                return;
            }
        }
    }

    async fn llm_review(
        &self,
        ctx: &AgentContext<'_>,
        candidates: &[String],
        findings: &mut Vec<AgentFinding>,
    ) {
        for relative_path in candidates.iter().take(MAX_LLM_FILES) {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let Ok(content) = read_text_lossy(&ctx.working_dir.join(relative_path)) else {
                continue;
            };
            let excerpt: String = content.chars().take(MAX_LLM_CHARS).collect();

            let mut prompt = format!(
                "You are reviewing security-sensitive source code.\n\
                 File: {relative_path}\n\
                 Return ONLY a JSON array of findings, each with fields: \
                 file_path, start_line, end_line, category, severity \
                 (Critical|High|Medium|Low|Info), description, explanation, \
                 suggested_fix, confidence (0..1). Return [] when nothing is wrong.\n\n\
                 ```\n{excerpt}\n```"
            );
            if let Some(retriever) = ctx.retriever {
                let hits = retriever
                    .related(&format!("security {relative_path}"), ctx.cancel)
                    .await;
                prompt.push_str(&crate::agents::retrieval::Retriever::render_context(&hits));
            }

            match self.chat.complete(&prompt, "security-review").await {
                Ok(response) => {
                    let mut parsed = parse_findings(&response);
                    for finding in &mut parsed {
                        finding.category = "Security".to_string();
                        finding
                            .file_path
                            .get_or_insert_with(|| relative_path.clone());
                    }
                    findings.extend(parsed);
                }
                Err(err) => {
                    // The regex passes stand on their own; the LLM pass is
                    // additive and may fail quietly.
                    warn!("security LLM review of {relative_path} failed: {err}");
                }
            }
        }
    }
}

#[async_trait]
impl AnalysisAgent for SecurityAgent {
    fn name(&self) -> &'static str {
        "Security"
    }

    async fn analyze(&self, ctx: &AgentContext<'_>) -> Result<AgentOutcome> {
        let mut findings = Vec::new();
        let mut llm_candidates = Vec::new();

        for plan in ctx.plans {
            if SENSITIVE_FILE.is_match(&plan.relative_path) {
                findings.push(AgentFinding {
                    id: Some(Uuid::new_v4()),
                    file_path: Some(plan.relative_path.clone()),
                    category: "Security".to_string(),
                    severity: "High".to_string(),
                    description: "Sensitive file committed to the repository".to_string(),
                    explanation: format!(
                        "{} looks like key material or environment secrets.",
                        plan.relative_path
                    ),
                    suggested_fix: "Remove the file from version control and rotate the material."
                        .to_string(),
                    confidence: 0.8,
                    ..AgentFinding::default()
                });
            }

            if !plan.decision.is_analyzed() {
                continue;
            }
            let Ok(content) = read_text_lossy(&ctx.working_dir.join(&plan.relative_path)) else {
                continue;
            };

            if CONFIG_EXTENSIONS.contains(&plan.extension.as_str()) {
                self.scan_config(&plan.relative_path, &content, &mut findings);
            } else {
                self.scan_source(&plan.relative_path, &content, &mut findings);
            }

            if SECURITY_PATH.is_match(&plan.relative_path) {
                llm_candidates.push(plan.relative_path.clone());
            }
        }

        debug!(
            local = findings.len(),
            llm_candidates = llm_candidates.len(),
            "security local passes complete"
        );
        self.llm_review(ctx, &llm_candidates, &mut findings).await;

        Ok(AgentOutcome {
            findings,
            recommendations: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RouterConfig;
    use crate::ingest::router::FileRouter;
    use tokio_util::sync::CancellationToken;

    struct SilentChat;

    #[async_trait]
    impl ChatClient for SilentChat {
        async fn complete(&self, _prompt: &str, _label: &str) -> Result<String> {
            Ok("[]".to_string())
        }
    }

    async fn run_on(files: &[(&str, &str)]) -> Vec<AgentFinding> {
        let dir = tempfile::tempdir().unwrap();
        for (path, body) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(&full, body).unwrap();
        }

        let router = FileRouter::new(RouterConfig::default());
        let plans = router.plan_tree(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        let ctx = AgentContext {
            project_id: Uuid::new_v4(),
            working_dir: dir.path(),
            plans: &plans,
            summaries: &[],
            retriever: None,
            cancel: &cancel,
        };

        SecurityAgent::new(Arc::new(SilentChat))
            .analyze(&ctx)
            .await
            .unwrap()
            .findings
    }

    #[tokio::test]
    async fn test_detects_hardcoded_secret() {
        let findings = run_on(&[(
            "src/db.cs",
            "var connection = Connect();\nvar password = \"hunter2secret\";\n",
        )])
        .await;

        assert!(findings
            .iter()
            .any(|f| f.description == "Hardcoded secret" && f.start_line == Some(2)));
    }

    #[tokio::test]
    async fn test_detects_sql_injection_shape() {
        let findings = run_on(&[(
            "src/repo.cs",
            "var q = \"SELECT * FROM users WHERE id = \" + userId;\n",
        )])
        .await;

        assert!(findings
            .iter()
            .any(|f| f.description == "Possible SQL injection"));
    }

    #[tokio::test]
    async fn test_detects_disabled_tls() {
        let findings = run_on(&[("src/http.py", "requests.get(url, verify=False)\n")]).await;
        assert!(findings
            .iter()
            .any(|f| f.description == "TLS verification disabled"));
    }

    #[tokio::test]
    async fn test_flags_sensitive_files_by_name() {
        let findings = run_on(&[
            ("certs/server.pem", "-----BEGIN-----\n"),
            ("appsettings.Production.json", "{}\n"),
        ])
        .await;

        let flagged: Vec<&str> = findings
            .iter()
            .filter(|f| f.description.contains("Sensitive file"))
            .filter_map(|f| f.file_path.as_deref())
            .collect();
        assert!(flagged.contains(&"certs/server.pem"));
        assert!(flagged.contains(&"appsettings.Production.json"));
    }

    #[tokio::test]
    async fn test_config_secret_heuristic() {
        let findings = run_on(&[(
            "config/app.json",
            "{\n  \"ConnectionString\": \"Server=db;Password=prodpass123\"\n}\n",
        )])
        .await;

        assert!(findings
            .iter()
            .any(|f| f.description == "Credential-like value in configuration"));
    }

    #[tokio::test]
    async fn test_clean_file_yields_nothing() {
        let findings = run_on(&[(
            "src/math.rs",
            "pub fn add(a: u32, b: u32) -> u32 { a + b }\n",
        )])
        .await;
        assert!(findings.is_empty(), "unexpected: {findings:?}");
    }

    #[test]
    fn test_one_finding_per_pattern_per_file() {
        let agent = SecurityAgent::new(Arc::new(SilentChat));
        let mut findings = Vec::new();
        let content = "var a = \"x\" ;\ndebugger;\ndebugger;\ndebugger;\n";
        agent.scan_source("src/a.js", content, &mut findings);
        let debug_findings = findings
            .iter()
            .filter(|f| f.description == "Leftover debug code")
            .count();
        assert_eq!(debug_findings, 1);
    }
}
