//! 工具层：Tool trait、注册表、带超时与审计的执行器、输出媒体识别

pub mod echo;
pub mod executor;
pub mod output;
pub mod registry;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use output::{sniff_mime, OutputKind, ToolOutput};
pub use registry::{Tool, ToolExample, ToolRegistry};
