//! Core of the manga reader: batched bubble analysis with prefetch, and the
//! speech playback that reads a page's bubbles aloud in reading order.
//!
//! Everything that talks to the outside world (the vision service, the page
//! images, the speech engine) is reached through the traits in [`analysis`]
//! and [`speech`], so the binary can plug real adapters in and the tests can
//! plug fakes in.

pub mod analysis;
pub mod analysis_cache;
pub mod batch;
pub mod cancellation;
pub mod coordinator;
pub mod deferred;
pub mod model;
pub mod normalizer;
pub mod playback;
pub mod reading_order;
pub mod sequence;
pub mod session;
pub mod speech;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{AnalysisError, AnalysisService, PageImage, PageSource, RawBubble};
pub use analysis_cache::{AnalysisCache, CacheHandle, CacheStats};
pub use batch::{BatchId, BatchPartitioner};
pub use coordinator::{AnalysisCoordinator, CacheUpdate, EnsureOutcome, PipelineConfig};
pub use model::{BoundingBox, Bubble, PageAnalysisEntry, PageIndex, PageStatus};
pub use normalizer::TextNormalizer;
pub use playback::{PlaybackState, PlaybackSynchronizer};
pub use session::{ReaderSession, ReaderSnapshot, SessionCommand, SessionEvent, SessionSettings};
pub use speech::{SpeechEngine, SpeechError};
