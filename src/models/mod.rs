pub mod scan;

pub use scan::{
    Finding, FindingType, Library, RiskLevel, ScanParameters, ScanStatus, Script, Severity,
    Vulnerability,
};
