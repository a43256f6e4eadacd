pub mod change;
pub mod chunker;
pub mod debounce;
pub mod parser;
pub mod pipeline;
pub mod scanner;
pub mod state;
pub mod watcher;

pub use change::detect_changes;
pub use chunker::{ChunkerConfig, chunk_document};
pub use debounce::{DebounceConfig, DebouncedWatcher};
pub use parser::{ParseError, ParsedDocument, Region, RegionKind, parse_file};
pub use pipeline::{
  FileOutcome, FilePipeline, IndexProgress, PipelineConfig, PipelineError, PipelineStats, Stage, stage_percent,
};
pub use scanner::{ScanResult, Scanner};
pub use state::decide;
pub use watcher::{ChangeKind, FileChange, FileWatcher, WatchError};
