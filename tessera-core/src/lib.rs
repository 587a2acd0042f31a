//! Tessera Core Library
//!
//! Core functionality for Tessera including:
//! - Object model (Blob, Tree, Commit, Tag) with SHA-256 content addressing
//! - Loose object storage with zstd compression and an LRU read cache
//! - Commit graph: topological order, ancestry and merge bases
//! - Line diffs, unified patches and patch application
//! - Three-way text and tree merges with smart conflict resolution
//! - Refs, staging index, repository lock and the `Repository` handle

pub mod config;
pub mod context;
pub mod dag;
pub mod diff;
pub mod error;
pub mod fsutil;
pub mod index;
pub mod lock;
pub mod merge;
pub mod merge_tree;
pub mod object;
pub mod patch;
pub mod pool;
pub mod refs;
pub mod repo;
pub mod smart;
pub mod storage;
pub mod tree;
pub mod worktree;

pub use config::{ConfigValue, RepoConfig};
pub use context::{CancelToken, OpContext, OpStats, OpStatsSnapshot};
pub use dag::{CommitClass, CommitGraph, CommitNode, CommitRange, GraphStatistics, Order};
pub use diff::{diff_lines, DiffLine, DiffOptions, Hunk, LineOp};
pub use error::{Error, Result};
pub use index::{Index, IndexEntry, StageState};
pub use lock::RepoLock;
pub use merge::{merge_file, merge_text, FileMergeResult, MergeChunk, MergeOptions, MergeState};
pub use merge_tree::{merge_trees, ConflictKind, FileConflict, TreeMergeResult};
pub use object::{Blob, Commit, Object, ObjectId, ObjectKind, RawObject, Tag, Tree, TreeEntry};
pub use patch::{apply_patches, generate_patches, parse_unified, ApplyMode, FileMapTarget, Patch, PatchStats, PatchTarget};
pub use refs::Head;
pub use repo::{BranchInfo, MergeOutcome, MergeReport, Repository, Status, TagInfo, WorkState};
pub use smart::{smart_merge, ConflictContext, Resolution, ResolutionStrategy, SmartOutcome};
pub use storage::{LooseStore, MemoryStore, ObjectStore, VerifyReport};
pub use tree::{build_tree, flatten_tree, FileEntry, FileMap};
