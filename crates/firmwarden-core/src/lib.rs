pub mod correlation;
pub mod evidence;
pub mod registry;
pub mod report;
pub mod runner;

pub use correlation::{
    analyze, explain_attack_path, AnalysisError, AttackPathExplainer, AttackPathExplanation,
    CorrelationEngine, CorrelationPolicy, CorrelationReport, ErrorConfidence, ErrorPayload,
    ExplainError, Finding, RuleId, Severity,
};
pub use evidence::{
    bundle_file::BundleFileProvider, Confidence, EvidenceBundle, EvidenceProvider,
    StaticEvidenceProvider,
};
pub use registry::{
    JsonFileStore, MemoryStore, ProcessHandle, RegistryError, RegistryStore, ScanId, ScanRecord,
    ScanRegistry, ScanStatus, StopOutcome,
};
pub use report::OutputFormat;
pub use runner::{
    AnalyzerSettings, LaunchedScan, ScanOrchestrator, ScanRequest, ScanStarted, StartError,
    ToolConfigError,
};
