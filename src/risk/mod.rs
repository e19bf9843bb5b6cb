// Risk scoring: pure functions from vulnerabilities + findings to 0-100
// scores. All arithmetic is f64; final scores are rounded half-up and
// clamped to [0, 100].

use crate::models::{FindingType, RiskLevel, Severity, Vulnerability};

/// Libraries common enough that a vulnerable version is usually patched
/// quickly downstream; their score is discounted by the advanced formula.
const POPULAR_LIBRARIES: &[&str] = &[
    "jquery",
    "react",
    "react-dom",
    "vue",
    "angular",
    "lodash",
    "moment",
    "bootstrap",
    "axios",
    "d3",
];

fn clamp_round(score: f64) -> i32 {
    score.clamp(0.0, 100.0).round() as i32
}

/// Highest CVSS score across the vulnerability list. Records without a
/// numeric score contribute a nominal value derived from their severity so
/// an advisory is never free.
fn max_cvss(vulns: &[Vulnerability]) -> f64 {
    vulns
        .iter()
        .map(|v| {
            v.cvss_score.unwrap_or(match v.severity {
                Severity::Critical => 9.0,
                Severity::High => 7.0,
                Severity::Moderate => 4.0,
                Severity::Low => 1.0,
            })
        })
        .fold(0.0, f64::max)
}

fn count_severity(vulns: &[Vulnerability], severity: Severity) -> usize {
    vulns.iter().filter(|v| v.severity == severity).count()
}

/// Baseline per-library risk:
/// `clamp(max(cvss) * 10 * confidence/100 + 15 * criticalCount, 0, 100)`,
/// times 1.5 when a public exploit is known.
pub fn calculate_library_risk(
    vulns: &[Vulnerability],
    confidence: i32,
    has_public_exploit: bool,
) -> i32 {
    if vulns.is_empty() {
        return 0;
    }

    let base = max_cvss(vulns) * 10.0;
    let scaled = base * (confidence as f64 / 100.0);
    let critical = count_severity(vulns, Severity::Critical) as f64;

    let mut score = scaled + 15.0 * critical;
    if has_public_exploit {
        score *= 1.5;
    }

    clamp_round(score)
}

/// Global risk across a scan:
/// `0.4*max + 0.3*avg + 5*count(risk >= 70) + 10*criticalFindings`.
pub fn calculate_global_risk(library_risks: &[i32], critical_findings: usize) -> i32 {
    let max = library_risks.iter().copied().max().unwrap_or(0) as f64;
    let avg = if library_risks.is_empty() {
        0.0
    } else {
        library_risks.iter().map(|&r| r as f64).sum::<f64>() / library_risks.len() as f64
    };
    let high_risk_count = library_risks.iter().filter(|&&r| r >= 70).count() as f64;

    clamp_round(0.4 * max + 0.3 * avg + 5.0 * high_risk_count + 10.0 * critical_findings as f64)
}

pub fn get_risk_level(score: i32) -> RiskLevel {
    if score >= 80 {
        RiskLevel::Critical
    } else if score >= 60 {
        RiskLevel::High
    } else if score >= 30 {
        RiskLevel::Moderate
    } else {
        RiskLevel::Low
    }
}

/// Per-finding penalty applied when a risky pattern is co-located with the
/// library's scripts.
fn finding_penalty(ft: FindingType) -> f64 {
    match ft {
        FindingType::EvalUsage => 25.0,
        FindingType::HardcodedToken => 30.0,
        FindingType::DynamicImport => 15.0,
        FindingType::RemoteCode => 35.0,
        FindingType::Webassembly => 20.0,
        _ => 0.0,
    }
}

/// Scoring variant used by the analyze worker. Starts from the advisory
/// profile, discounts low-confidence detections, penalises co-located risky
/// patterns, discounts well-known libraries and inflates stale versions.
pub fn advanced_library_risk(
    name: &str,
    vulns: &[Vulnerability],
    confidence: i32,
    colocated_findings: &[FindingType],
    version_age_days: Option<i64>,
) -> i32 {
    let critical = count_severity(vulns, Severity::Critical) as f64;
    let high = count_severity(vulns, Severity::High) as f64;

    let mut score = if vulns.is_empty() {
        0.0
    } else {
        max_cvss(vulns) * 10.0
    };
    score += 20.0 * critical + 10.0 * high;
    score -= 0.3 * (100.0 - confidence as f64);
    score = score.max(0.0);

    for ft in colocated_findings {
        score += finding_penalty(*ft);
    }

    if POPULAR_LIBRARIES.contains(&name.to_ascii_lowercase().as_str()) {
        score *= 0.8;
    }

    match version_age_days {
        Some(days) if days > 365 => score *= 1.3,
        Some(days) if days > 180 => score *= 1.1,
        _ => {}
    }

    clamp_round(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vuln(severity: Severity, cvss: Option<f64>) -> Vulnerability {
        Vulnerability {
            id: "GHSA-test".to_string(),
            title: "test advisory".to_string(),
            description: String::new(),
            severity,
            cvss_score: cvss,
            references: vec![],
        }
    }

    #[test]
    fn empty_vulns_score_zero() {
        assert_eq!(calculate_library_risk(&[], 100, false), 0);
    }

    #[test]
    fn jquery_scenario_scores_93() {
        // One critical advisory (cvss 9.8), confidence 80:
        // 9.8 * 10 * 0.8 + 15 * 1 = 93.4 -> 93
        let vulns = vec![vuln(Severity::Critical, Some(9.8))];
        let score = calculate_library_risk(&vulns, 80, false);
        assert!((92..=94).contains(&score), "got {score}");
    }

    #[test]
    fn public_exploit_multiplies() {
        let vulns = vec![vuln(Severity::High, Some(7.0))];
        let base = calculate_library_risk(&vulns, 100, false);
        let exploited = calculate_library_risk(&vulns, 100, true);
        assert!(exploited > base);
        assert_eq!(exploited, 100); // 70 * 1.5 clamps
    }

    #[test]
    fn adding_a_vulnerability_never_decreases_risk() {
        let mut vulns = vec![vuln(Severity::High, Some(7.5))];
        let before = calculate_library_risk(&vulns, 80, false);
        for extra in [
            vuln(Severity::Low, Some(2.0)),
            vuln(Severity::Moderate, Some(5.0)),
            vuln(Severity::Critical, Some(9.9)),
        ] {
            vulns.push(extra);
            let after = calculate_library_risk(&vulns, 80, false);
            assert!(after >= before, "after {after} < before {before}");
        }
    }

    #[test]
    fn adding_critical_findings_never_decreases_global_risk() {
        let risks = vec![40, 75, 20];
        let mut prev = calculate_global_risk(&risks, 0);
        for n in 1..5 {
            let next = calculate_global_risk(&risks, n);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn global_risk_formula() {
        // max 80, avg 50, one >= 70, no critical findings:
        // 0.4*80 + 0.3*50 + 5 = 52
        assert_eq!(calculate_global_risk(&[80, 20], 0), 52);
        assert_eq!(calculate_global_risk(&[], 0), 0);
        assert_eq!(calculate_global_risk(&[], 3), 30);
    }

    #[test]
    fn risk_level_thresholds() {
        assert_eq!(get_risk_level(80), RiskLevel::Critical);
        assert_eq!(get_risk_level(79), RiskLevel::High);
        assert_eq!(get_risk_level(60), RiskLevel::High);
        assert_eq!(get_risk_level(59), RiskLevel::Moderate);
        assert_eq!(get_risk_level(30), RiskLevel::Moderate);
        assert_eq!(get_risk_level(29), RiskLevel::Low);
    }

    #[test]
    fn advanced_scoring_discounts_popular_and_inflates_stale() {
        let vulns = vec![vuln(Severity::High, Some(7.0))];
        let obscure = advanced_library_risk("leftpadx", &vulns, 100, &[], None);
        let popular = advanced_library_risk("jquery", &vulns, 100, &[], None);
        assert!(popular < obscure);

        let fresh = advanced_library_risk("leftpadx", &vulns, 100, &[], Some(30));
        let aging = advanced_library_risk("leftpadx", &vulns, 100, &[], Some(200));
        let stale = advanced_library_risk("leftpadx", &vulns, 100, &[], Some(400));
        assert!(fresh <= aging && aging <= stale);
    }

    #[test]
    fn advanced_scoring_applies_finding_penalties() {
        let vulns = vec![vuln(Severity::Low, Some(2.0))];
        let clean = advanced_library_risk("leftpadx", &vulns, 100, &[], None);
        let risky = advanced_library_risk(
            "leftpadx",
            &vulns,
            100,
            &[FindingType::EvalUsage, FindingType::HardcodedToken],
            None,
        );
        // +25 for eval, +30 for the hardcoded token
        assert_eq!(risky - clean, 55);
    }

    #[test]
    fn low_confidence_is_discounted() {
        let vulns = vec![vuln(Severity::High, Some(7.0))];
        let sure = advanced_library_risk("leftpadx", &vulns, 100, &[], None);
        let unsure = advanced_library_risk("leftpadx", &vulns, 40, &[], None);
        assert!(unsure < sure);
    }
}
