use bookmarkd::config::StorageConfig;
use bookmarkd::order::{self, Allocation};
use bookmarkd::{Daemon, DisabledVcs, Operation, ROOT_ID, SqliteStorage, Tree};
use proptest::prelude::*;
use proptest::sample::select;
use proptest::test_runner::Config;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Title the store gives the root folder
const ROOT_LABEL: &str = "Root";

proptest! {
    #[test]
    fn allocated_ord_lands_between_neighbours(
        mut ords in prop::collection::vec(-1000.0f64..1000.0, 0..20),
        index in prop::option::of(-2i64..25),
    ) {
        ords.sort_by(f64::total_cmp);
        ords.dedup_by(|a, b| (*a - *b).abs() < 1.0);

        let pos = order::insertion_position(ords.len(), index);
        match order::allocate(&ords, index) {
            Allocation::Ord(ord) => {
                if pos > 0 {
                    prop_assert!(ord > ords[pos - 1]);
                }
                if pos < ords.len() {
                    prop_assert!(ord < ords[pos]);
                }
            }
            Allocation::NeedsRebalance => prop_assert!(false, "gaps of at least 1 never rebalance"),
        }
    }
}

/// Reference tree keyed by node title; titles are unique in these runs
#[derive(Clone, Debug)]
struct ModelTree {
    folders: BTreeMap<String, bool>,
    parents: BTreeMap<String, String>,
    children: BTreeMap<String, Vec<String>>,
    next: u64,
    last_rejected: bool,
}

impl ModelTree {
    fn new() -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(ROOT_LABEL.to_string(), true);
        Self {
            folders,
            parents: BTreeMap::new(),
            children: BTreeMap::new(),
            next: 0,
            last_rejected: false,
        }
    }

    fn labels(&self) -> Vec<String> {
        self.folders.keys().cloned().collect()
    }

    fn folder_labels(&self) -> Vec<String> {
        self.folders
            .iter()
            .filter(|(_, folder)| **folder)
            .map(|(label, _)| label.clone())
            .collect()
    }

    fn contains(&self, label: &str) -> bool {
        self.folders.contains_key(label)
    }

    fn child_count(&self, parent: &str, exclude: Option<&str>) -> usize {
        self.children
            .get(parent)
            .map(|c| c.iter().filter(|l| Some(l.as_str()) != exclude).count())
            .unwrap_or(0)
    }

    fn is_within(&self, label: &str, ancestor: &str) -> bool {
        let mut current = Some(label.to_string());
        while let Some(l) = current {
            if l == ancestor {
                return true;
            }
            current = self.parents.get(&l).cloned();
        }
        false
    }

    fn insert(&mut self, label: &str, parent: &str, index: Option<i64>, folder: bool) {
        self.folders.insert(label.to_string(), folder);
        self.parents.insert(label.to_string(), parent.to_string());
        let siblings = self.children.entry(parent.to_string()).or_default();
        let pos = order::insertion_position(siblings.len(), index);
        siblings.insert(pos, label.to_string());
    }

    fn detach(&mut self, label: &str) {
        if let Some(parent) = self.parents.remove(label) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|l| l != label);
            }
        }
    }

    fn remove_subtree(&mut self, label: &str) {
        self.detach(label);
        let mut stack = vec![label.to_string()];
        while let Some(l) = stack.pop() {
            self.folders.remove(&l);
            self.parents.remove(&l);
            if let Some(kids) = self.children.remove(&l) {
                stack.extend(kids);
            }
        }
    }
}

#[derive(Clone, Debug)]
enum Step {
    AddFolder {
        label: String,
        parent: String,
        index: Option<i64>,
    },
    AddBookmark {
        label: String,
        parent: String,
        index: Option<i64>,
    },
    Move {
        node: String,
        new_parent: String,
        index: Option<i64>,
    },
    Delete {
        node: String,
    },
}

struct TreeModel;

impl ReferenceStateMachine for TreeModel {
    type State = ModelTree;
    type Transition = Step;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ModelTree::new()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let labels = state.labels();
        let folders = state.folder_labels();
        let index = || prop::option::of(0i64..6);
        let folder_label = format!("f{}", state.next);
        let bookmark_label = format!("b{}", state.next);

        prop_oneof![
            3 => (select(folders.clone()), index()).prop_map(move |(parent, index)| {
                Step::AddFolder {
                    label: folder_label.clone(),
                    parent,
                    index,
                }
            }),
            3 => (select(folders.clone()), index()).prop_map(move |(parent, index)| {
                Step::AddBookmark {
                    label: bookmark_label.clone(),
                    parent,
                    index,
                }
            }),
            2 => (select(labels.clone()), select(folders), index()).prop_map(
                |(node, new_parent, index)| Step::Move {
                    node,
                    new_parent,
                    index,
                }
            ),
            1 => select(labels).prop_map(|node| Step::Delete { node }),
        ]
        .boxed()
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            Step::AddFolder { label, parent, .. } | Step::AddBookmark { label, parent, .. } => {
                !state.contains(label) && state.folders.get(parent) == Some(&true)
            }
            Step::Move {
                node, new_parent, ..
            } => state.contains(node) && state.folders.get(new_parent) == Some(&true),
            Step::Delete { node } => state.contains(node),
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        state.next += 1;
        state.last_rejected = false;
        match transition {
            Step::AddFolder {
                label,
                parent,
                index,
            }
            | Step::AddBookmark {
                label,
                parent,
                index,
            } => {
                if index.is_some_and(|i| i as usize > state.child_count(parent, None)) {
                    state.last_rejected = true;
                } else {
                    let folder = matches!(transition, Step::AddFolder { .. });
                    state.insert(label, parent, *index, folder);
                }
            }
            Step::Move {
                node,
                new_parent,
                index,
            } => {
                let rejected = node == ROOT_LABEL
                    || state.is_within(new_parent, node)
                    || index.is_some_and(|i| i as usize > state.child_count(new_parent, Some(node)));
                if rejected {
                    state.last_rejected = true;
                } else {
                    let folder = state.folders[node];
                    state.detach(node);
                    state.insert(node, new_parent, *index, folder);
                }
            }
            Step::Delete { node } => {
                if node == ROOT_LABEL {
                    state.last_rejected = true;
                } else {
                    state.remove_subtree(node);
                }
            }
        }
        state
    }
}

struct StoreUnderTest {
    _temp: TempDir,
    rt: Runtime,
    daemon: Arc<Daemon<SqliteStorage>>,
}

impl StoreUnderTest {
    fn tree(&self) -> Tree {
        self.rt.block_on(self.daemon.get_tree()).unwrap()
    }

    fn id_of(tree: &Tree, label: &str) -> String {
        if label == ROOT_LABEL {
            return ROOT_ID.to_string();
        }
        tree.nodes
            .values()
            .find(|n| n.title == label)
            .map(|n| n.id.clone())
            .unwrap_or_else(|| panic!("store lost node {label}"))
    }
}

struct StoreMachine;

impl StateMachineTest for StoreMachine {
    type SystemUnderTest = StoreUnderTest;
    type Reference = TreeModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(
            SqliteStorage::open(temp.path().join("state.db"), &StorageConfig::default()).unwrap(),
        );
        let daemon = Arc::new(Daemon::new(
            storage,
            Arc::new(DisabledVcs),
            temp.path().join("snapshot.json"),
            "main",
        ));
        StoreUnderTest {
            _temp: temp,
            rt: Runtime::new().unwrap(),
            daemon,
        }
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let tree = state.tree();
        let id = |label: &str| StoreUnderTest::id_of(&tree, label);

        let op = match &transition {
            Step::AddFolder {
                label,
                parent,
                index,
            } => Operation::AddFolder {
                parent_id: id(parent),
                title: label.clone(),
                index: *index,
            },
            Step::AddBookmark {
                label,
                parent,
                index,
            } => Operation::AddBookmark {
                parent_id: id(parent),
                title: label.clone(),
                url: format!("https://{label}.example/"),
                index: *index,
            },
            Step::Move {
                node,
                new_parent,
                index,
            } => Operation::MoveNode {
                node_id: id(node),
                new_parent_id: id(new_parent),
                new_index: *index,
            },
            Step::Delete { node } => Operation::DeleteNode {
                node_id: id(node),
                recursive: true,
            },
        };

        let result = state.rt.block_on(state.daemon.apply_ops(vec![op]));
        assert_eq!(
            result.is_err(),
            ref_state.last_rejected,
            "store and model disagree on {transition:?}: {:?}",
            result.err()
        );
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let tree = state.tree();
        assert_eq!(tree.nodes.len(), ref_state.folders.len());

        for label in ref_state.labels() {
            let id = StoreUnderTest::id_of(&tree, &label);
            let actual: Vec<&str> = tree
                .children_of(&id)
                .iter()
                .map(|child| tree.nodes[child].title.as_str())
                .collect();
            let expected: Vec<&str> = ref_state
                .children
                .get(&label)
                .map(|c| c.iter().map(String::as_str).collect())
                .unwrap_or_default();
            assert_eq!(actual, expected, "children of {label}");
        }
    }
}

prop_state_machine! {
    #![proptest_config(Config {
        cases: 32,
        .. Config::default()
    })]

    #[test]
    fn store_matches_model(
        sequential
        1..40
        =>
        StoreMachine
    );
}
