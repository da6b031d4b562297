// Read-only inspection of department networks
pub mod capture;
pub mod recommend;
pub mod report;

pub use capture::{CaptureResult, CaptureSummary, TcpdumpCapture, TrafficCapture};
pub use report::{
    BridgeReport, DaemonReport, DiagnosticReport, KernelReport, NatReport, TapReport,
};
