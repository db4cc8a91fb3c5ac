//! Initial sync for a new replica-set member: pick a sync source, clone its
//! collections while tailing its oplog, then apply the tail until the local
//! copy is consistent.

pub mod applier;
pub mod cloner;
pub mod coordinator;
pub mod fault;
pub mod fetcher;
pub mod inprocess;
pub mod progress;
pub mod retry;
pub mod selector;
pub mod transport;

pub use applier::{apply_operation, OplogApplier, TxnStaging};
pub use cloner::{ClonerEvent, ClonerStage, ClonerStats, CollectionCloner, DocumentStream, ResumeToken};
pub use coordinator::InitialSyncCoordinator;
pub use fault::{FaultInjector, FaultPoint};
pub use fetcher::{FetcherHandle, OplogFetcher};
pub use inprocess::{InProcessConnector, InProcessSource};
pub use progress::{InitialSyncProgress, InitialSyncState};
pub use retry::RetryPolicy;
pub use selector::SyncSourceSelector;
pub use transport::{MemberState, PeerInfo, SourceClient, SourceConnector, StaticTopology, TopologyView};
