pub mod engine;
pub mod exclusion;
pub mod feeds;
pub mod learning;
pub mod retry;
pub mod rules;
pub(crate) mod util;

pub use engine::{CandidateInvoice, MatchConfig, MatchInput, MatchKind, Outcome, ReconEngine};
pub use exclusion::ExclusionPolicy;
pub use feeds::{FeedError, IngestReport, NewTransaction, RawEvent, SkipReason};
pub use learning::{reinforce, weaken, recompute_confidence, synthesize_rule, Observation};
pub use retry::{CancelFlag, Feed, FeedChunk, RetryPolicy};
pub use rules::{MatchingRule, RuleSet, RuleTarget, TriggerKind};
