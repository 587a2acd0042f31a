//! Property tests for hashing, graph ordering, patches and merges

use proptest::prelude::*;
use std::collections::HashMap;

use tessera_core::diff::{diff_lines, DiffOptions};
use tessera_core::object::{hash_object, MODE_EXECUTABLE, MODE_FILE};
use tessera_core::patch::{apply_hunks, diff_file_maps, parse_unified, ApplyMode, FileMapTarget};
use tessera_core::{
    apply_patches, merge_text, CommitGraph, FileEntry, FileMap, MemoryStore, ObjectId, ObjectKind, ObjectStore,
    OpContext, Order, Patch,
};

fn id(n: usize) -> ObjectId {
    hash_object(ObjectKind::Commit, format!("commit-{}", n).as_bytes())
}

fn text_from(lines: &[u8]) -> String {
    lines.iter().map(|b| format!("line {}\n", b)).collect()
}

/// Random DAG: each commit picks up to two distinct earlier commits as
/// parents
fn dag_strategy() -> impl Strategy<Value = Vec<(Vec<usize>, i64)>> {
    prop::collection::vec((prop::collection::vec(any::<prop::sample::Index>(), 0..3), 0i64..50), 1..30)
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (picks, ts))| {
                    let mut parents: Vec<usize> = if i == 0 {
                        Vec::new()
                    } else {
                        picks.iter().map(|p| p.index(i)).collect()
                    };
                    parents.sort_unstable();
                    parents.dedup();
                    (parents, ts)
                })
                .collect()
        })
}

fn build_graph(shape: &[(Vec<usize>, i64)]) -> CommitGraph {
    let mut graph = CommitGraph::new();
    for (i, (parents, ts)) in shape.iter().enumerate() {
        let parent_ids: Vec<ObjectId> = parents.iter().map(|p| id(*p)).collect();
        graph
            .add_commit(id(i), &format!("c{}", i), "prop", *ts, &parent_ids)
            .unwrap();
    }
    graph
}

const PATHS: [&str; 5] = ["a", "b", "c", "d/e", "d/f"];

/// Per path: absent, or content lines, a binary flag and an executable flag
type FileShape = Option<(Vec<u8>, bool, bool)>;

fn snapshot_strategy() -> impl Strategy<Value = Vec<FileShape>> {
    prop::collection::vec(
        prop::option::of((prop::collection::vec(0u8..6, 0..12), any::<bool>(), any::<bool>())),
        PATHS.len(),
    )
}

fn file_map(store: &MemoryStore, shape: &[FileShape]) -> FileMap {
    let mut files = FileMap::new();
    for (path, file) in PATHS.iter().zip(shape) {
        if let Some((lines, binary, executable)) = file {
            let mut data = text_from(lines).into_bytes();
            if *binary {
                data.push(0);
            }
            let mode = if *executable { MODE_EXECUTABLE } else { MODE_FILE };
            files.insert(path.to_string(), FileEntry::new(store.write_blob(&data).unwrap(), mode));
        }
    }
    files
}

proptest! {
    #[test]
    fn prop_hash_depends_only_on_kind_and_content(data in prop::collection::vec(any::<u8>(), 0..256)) {
        prop_assert_eq!(hash_object(ObjectKind::Blob, &data), hash_object(ObjectKind::Blob, &data));
        prop_assert_ne!(hash_object(ObjectKind::Blob, &data), hash_object(ObjectKind::Tree, &data));
    }

    #[test]
    fn prop_topological_sort_puts_parents_first(shape in dag_strategy()) {
        let graph = build_graph(&shape);
        let order = graph.topological_sort();
        prop_assert_eq!(order.len(), shape.len());

        let position: HashMap<ObjectId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (i, (parents, _)) in shape.iter().enumerate() {
            for p in parents {
                prop_assert!(position[&id(*p)] < position[&id(i)]);
            }
        }
        // Same input, same output
        prop_assert_eq!(graph.topological_sort(), order);
    }

    #[test]
    fn prop_topological_range_emits_children_first(shape in dag_strategy()) {
        let graph = build_graph(&shape);
        let walked: Vec<ObjectId> = graph.commits_in_range(usize::MAX, Order::Topological).map(|n| n.id).collect();
        prop_assert_eq!(walked.len(), shape.len());
        let position: HashMap<ObjectId, usize> = walked.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for (i, (parents, _)) in shape.iter().enumerate() {
            for p in parents {
                prop_assert!(position[&id(i)] < position[&id(*p)]);
            }
        }
    }

    #[test]
    fn prop_topological_range_reverses_sort(shape in dag_strategy()) {
        let graph = build_graph(&shape);
        let mut sorted = graph.topological_sort();
        sorted.reverse();
        let walked: Vec<ObjectId> = graph.commits_in_range(usize::MAX, Order::Topological).map(|n| n.id).collect();
        prop_assert_eq!(&walked, &sorted);

        // Graph rows list commits in the same order
        let rows: Vec<String> = graph
            .ascii_graph(usize::MAX)
            .lines()
            .filter(|line| line.contains('*'))
            .map(|line| {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                tokens[tokens.len() - 2].to_string()
            })
            .collect();
        let expected: Vec<String> = sorted.iter().map(|id| id.short()).collect();
        prop_assert_eq!(rows, expected);
    }

    #[test]
    fn prop_statistics_partition_commits(shape in dag_strategy()) {
        let stats = build_graph(&shape).statistics();
        prop_assert_eq!(stats.root_commits + stats.regular_commits + stats.merge_commits, stats.total_commits);
        prop_assert!(stats.tips >= 1);
    }

    #[test]
    fn prop_strict_patch_reproduces_target(
        old in prop::collection::vec(0u8..8, 0..40),
        new in prop::collection::vec(0u8..8, 0..40),
        context in 0usize..4,
    ) {
        let (old, new) = (text_from(&old), text_from(&new));
        let hunks = diff_lines(&old, &new, DiffOptions { context });
        prop_assert_eq!(apply_hunks(&old, &hunks, ApplyMode::Strict), Some(new));
    }

    #[test]
    fn prop_snapshot_patches_reproduce_target(
        before in snapshot_strategy(),
        after in snapshot_strategy(),
        context in 0usize..4,
    ) {
        let store = MemoryStore::new();
        let (a, b) = (file_map(&store, &before), file_map(&store, &after));
        let patches = diff_file_maps(&store, &a, &b, DiffOptions { context }, &OpContext::new()).unwrap();

        let mut target = FileMapTarget::new(&store, a.clone());
        prop_assert!(apply_patches(&patches, &mut target, ApplyMode::Strict, false).unwrap());
        prop_assert_eq!(target.files(), &b);

        // The rendered text carries the same patch set
        let text: String = patches.iter().map(Patch::to_unified).collect();
        let parsed = parse_unified(&text).unwrap();
        prop_assert_eq!(&parsed, &patches);
        let mut target = FileMapTarget::new(&store, a);
        let applied = apply_patches(&parsed, &mut target, ApplyMode::Fuzzy { max_offset: 3 }, false).unwrap();
        prop_assert!(applied);
        prop_assert_eq!(target.into_files(), b);
    }

    #[test]
    fn prop_merge_with_unchanged_side_takes_other(
        base in prop::collection::vec(0u8..8, 0..30),
        changed in prop::collection::vec(0u8..8, 0..30),
    ) {
        let (base, changed) = (text_from(&base), text_from(&changed));
        let left = merge_text(&base, &changed, &base);
        prop_assert_eq!(left.merged_text(), Some(changed.clone()));
        let right = merge_text(&base, &base, &changed);
        prop_assert_eq!(right.merged_text(), Some(changed));
    }

    #[test]
    fn prop_identical_sides_never_conflict(
        base in prop::collection::vec(0u8..8, 0..30),
        side in prop::collection::vec(0u8..8, 0..30),
    ) {
        let (base, side) = (text_from(&base), text_from(&side));
        let result = merge_text(&base, &side, &side);
        prop_assert_eq!(result.merged_text(), Some(side));
    }

    #[test]
    fn prop_edits_in_separate_halves_merge_cleanly(
        head in prop::collection::vec(0u8..8, 1..10),
        tail in prop::collection::vec(0u8..8, 1..10),
        head_edit in prop::collection::vec(100u8..108, 1..5),
        tail_edit in prop::collection::vec(100u8..108, 1..5),
    ) {
        // A fixed separator keeps the two edited regions apart
        let sep = "separator\n";
        let base = format!("{}{}{}", text_from(&head), sep, text_from(&tail));
        let ours = format!("{}{}{}", text_from(&head_edit), sep, text_from(&tail));
        let theirs = format!("{}{}{}", text_from(&head), sep, text_from(&tail_edit));
        let expected = format!("{}{}{}", text_from(&head_edit), sep, text_from(&tail_edit));

        let result = merge_text(&base, &ours, &theirs);
        prop_assert_eq!(result.merged_text(), Some(expected));
    }
}
