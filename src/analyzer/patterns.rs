// Risky JavaScript pattern detection: a line-by-line regex scan over script
// bodies. Each hit produces a finding carrying the trimmed evidence line and
// its 1-based line number.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Finding, FindingType, Severity};

struct RiskyPattern {
    finding_type: FindingType,
    severity: Severity,
    title: &'static str,
    description: &'static str,
    regex: Lazy<Regex>,
}

static PATTERNS: [RiskyPattern; 5] = [
    RiskyPattern {
        finding_type: FindingType::EvalUsage,
        severity: Severity::High,
        title: "Use of eval() detected",
        description: "eval() executes arbitrary strings as code and is a common injection vector.",
        regex: Lazy::new(|| Regex::new(r"\beval\s*\(").expect("valid regex")),
    },
    RiskyPattern {
        finding_type: FindingType::HardcodedToken,
        severity: Severity::Critical,
        title: "Hardcoded credential detected",
        description: "A token, key, secret or password appears to be embedded in script source.",
        regex: Lazy::new(|| {
            Regex::new(r#"(?:token|key|secret|password)\s*[:=]\s*['"][A-Za-z0-9+/]{20,}['"]"#)
                .expect("valid regex")
        }),
    },
    RiskyPattern {
        finding_type: FindingType::DynamicImport,
        severity: Severity::Moderate,
        title: "Dynamic import() usage",
        description: "import() loads code at runtime; the loaded URL may be attacker-influenced.",
        regex: Lazy::new(|| Regex::new(r"\bimport\s*\(").expect("valid regex")),
    },
    RiskyPattern {
        finding_type: FindingType::Webassembly,
        severity: Severity::Moderate,
        title: "WebAssembly instantiation detected",
        description: "WebAssembly modules are opaque to static inspection.",
        regex: Lazy::new(|| Regex::new(r"WebAssembly\.instantiate").expect("valid regex")),
    },
    RiskyPattern {
        finding_type: FindingType::DomXssSink,
        severity: Severity::High,
        title: "DOM XSS sink detected",
        description: "Assignment to an HTML-interpreting sink can execute attacker-controlled markup.",
        regex: Lazy::new(|| {
            Regex::new(r"(?:(?:innerHTML|outerHTML)\s*=|insertAdjacentHTML\s*\(|document\.write(?:ln)?\s*\()")
                .expect("valid regex")
        }),
    },
];

/// Scan a script body for risky patterns. `location` names the script (its
/// URL or an inline-script label); the emitted findings point at
/// `{location}:{line}`.
pub fn detect_risky_patterns(content: &str, location: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        // Very long minified lines still scan fine; cap evidence size only.
        for pattern in &PATTERNS {
            if pattern.regex.is_match(line) {
                let trimmed = line.trim();
                let evidence = if trimmed.len() > 300 {
                    let mut end = 300;
                    while !trimmed.is_char_boundary(end) {
                        end -= 1;
                    }
                    format!("{}…", &trimmed[..end])
                } else {
                    trimmed.to_string()
                };
                findings.push(Finding {
                    finding_type: pattern.finding_type,
                    title: pattern.title.to_string(),
                    description: pattern.description.to_string(),
                    severity: pattern.severity,
                    location: format!("{}:{}", location, idx + 1),
                    evidence: Some(evidence),
                });
            }
        }
    }

    findings
}

/// Labels of the distinct risky pattern kinds present in a script, in stable
/// order. Persisted on the script row as `detected_patterns`.
pub fn pattern_labels(findings: &[Finding]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for f in findings {
        let label = f.finding_type.as_str().to_string();
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_eval_with_line_numbers() {
        let src = "var a = 1;\nvar b = eval('2 + 2');\n";
        let findings = detect_risky_patterns(src, "app.js");
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.finding_type, FindingType::EvalUsage);
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.location, "app.js:2");
        assert_eq!(f.evidence.as_deref(), Some("var b = eval('2 + 2');"));
    }

    #[test]
    fn does_not_flag_evaluate_identifiers() {
        let src = "function evaluateScore(x) { return x; }\nevaluate(1);\n";
        assert!(detect_risky_patterns(src, "s.js").is_empty());
    }

    #[test]
    fn detects_hardcoded_token() {
        let src = r#"const config = { apiToken: "", secret: "AAAABBBBCCCCDDDDEEEEFFFF" };"#;
        // "secret = "..."" form
        let src2 = r#"var password = "AAAABBBBCCCCDDDDEEEEFFFF";"#;
        let f1 = detect_risky_patterns(src, "cfg.js");
        let f2 = detect_risky_patterns(src2, "cfg.js");
        assert!(f1.iter().any(|f| f.finding_type == FindingType::HardcodedToken));
        assert!(f2.iter().any(|f| f.finding_type == FindingType::HardcodedToken));
    }

    #[test]
    fn short_values_are_not_tokens() {
        let src = r#"var token = "abc123";"#;
        assert!(detect_risky_patterns(src, "s.js").is_empty());
    }

    #[test]
    fn detects_dynamic_import_and_wasm() {
        let src = "import('./chunk.js');\nWebAssembly.instantiate(buf);\n";
        let findings = detect_risky_patterns(src, "m.js");
        let kinds: Vec<_> = findings.iter().map(|f| f.finding_type).collect();
        assert!(kinds.contains(&FindingType::DynamicImport));
        assert!(kinds.contains(&FindingType::Webassembly));
    }

    #[test]
    fn detects_dom_xss_sinks() {
        for src in [
            "el.innerHTML = userInput;",
            "node.outerHTML= html;",
            "el.insertAdjacentHTML('beforeend', html);",
            "document.write(payload);",
            "document.writeln(payload);",
        ] {
            let findings = detect_risky_patterns(src, "x.js");
            assert_eq!(findings.len(), 1, "no sink hit for: {src}");
            assert_eq!(findings[0].finding_type, FindingType::DomXssSink);
        }
    }

    #[test]
    fn static_import_statement_is_not_flagged() {
        let src = "import { foo } from './foo.js';";
        assert!(detect_risky_patterns(src, "s.js").is_empty());
    }

    #[test]
    fn same_input_yields_same_findings() {
        let src = "eval(x);\nel.innerHTML = y;\neval(z);\n";
        let a = detect_risky_patterns(src, "s.js");
        let b = detect_risky_patterns(src, "s.js");
        assert_eq!(a.len(), b.len());
        assert_eq!(a.len(), 3);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.location, y.location);
            assert_eq!(x.evidence, y.evidence);
        }
    }

    #[test]
    fn pattern_labels_are_deduplicated() {
        let src = "eval(a);\neval(b);\nimport('./x');\n";
        let findings = detect_risky_patterns(src, "s.js");
        assert_eq!(pattern_labels(&findings), vec!["EVAL_USAGE", "DYNAMIC_IMPORT"]);
    }
}
