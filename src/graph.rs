//! Dependency graph over component records.
//!
//! Two edge kinds are kept:
//!
//! - **children** (composite → child): physical containment. Must be a strict
//!   hierarchy, drives initialization order.
//! - **affects** (source → affected): causal/optical-path documentation. May
//!   form cycles (a feedback alignment loop), never used for ordering.

use crate::component::{ComponentRecord, Role};
use crate::error::{ModelError, ModelResult};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Validated, cycle-free view of a declaration.
#[derive(Debug, Clone)]
pub struct ComponentGraph {
    records: Vec<ComponentRecord>,
    index: HashMap<String, usize>,
    /// composite → children, in label order
    children: Vec<Vec<usize>>,
    /// child → its single composite
    parent: Vec<Option<usize>>,
    affects: Vec<Vec<usize>>,
    affected_by: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ComponentGraph {
    /// Resolve references, reject structural errors and compute the init order.
    pub fn build(records: Vec<ComponentRecord>) -> ModelResult<Self> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            record.validate()?;
            if index.insert(record.name.clone(), i).is_some() {
                return Err(ModelError::DuplicateComponent(record.name.clone()));
            }
        }

        let resolve = |component: &str, reference: &str| {
            index
                .get(reference)
                .copied()
                .ok_or_else(|| ModelError::DanglingReference {
                    component: component.to_string(),
                    reference: reference.to_string(),
                })
        };

        let count = records.len();
        let mut children = vec![Vec::new(); count];
        let mut parent: Vec<Option<usize>> = vec![None; count];
        let mut affects = vec![Vec::new(); count];
        let mut affected_by = vec![Vec::new(); count];

        for (i, record) in records.iter().enumerate() {
            for child_name in record.children.values() {
                let child = resolve(&record.name, child_name)?;
                if !children[i].contains(&child) {
                    children[i].push(child);
                }
            }
            for target_name in record.affects_set() {
                let target = resolve(&record.name, target_name)?;
                affects[i].push(target);
                affected_by[target].push(i);
            }
        }

        // before the shared-child check: a cycle's entry node has two parents
        if let Some(cycle) = find_composition_cycle(&children) {
            return Err(ModelError::CyclicComposition {
                cycle: cycle.into_iter().map(|i| records[i].name.clone()).collect(),
            });
        }

        for (i, kids) in children.iter().enumerate() {
            for &child in kids {
                if let Some(first) = parent[child] {
                    return Err(ModelError::SharedChild {
                        child: records[child].name.clone(),
                        first: records[first].name.clone(),
                        second: records[i].name.clone(),
                    });
                }
                parent[child] = Some(i);
            }
        }

        let order = children_first_order(&children, &parent);

        Ok(Self {
            records,
            index,
            children,
            parent,
            affects,
            affected_by,
            order,
        })
    }

    /// All records in declaration order.
    pub fn records(&self) -> &[ComponentRecord] {
        &self.records
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True for an empty declaration.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look a record up by name.
    pub fn record(&self, name: &str) -> Option<&ComponentRecord> {
        self.index.get(name).map(|&i| &self.records[i])
    }

    /// True if `name` is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Topological order over children edges: children before their composite.
    ///
    /// Independent components keep their declaration order.
    pub fn init_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.records[i].name.as_str())
            .collect()
    }

    /// Names of the children of a composite (empty for leaves and unknown names).
    pub fn children_of(&self, name: &str) -> Vec<&str> {
        self.names(self.index.get(name).map(|&i| &self.children[i]))
    }

    /// The composite that lists `name` as a child, if any.
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        let i = *self.index.get(name)?;
        self.parent[i].map(|p| self.records[p].name.as_str())
    }

    /// Components whose output `name` modifies.
    pub fn affects(&self, name: &str) -> BTreeSet<&str> {
        self.names(self.index.get(name).map(|&i| &self.affects[i]))
            .into_iter()
            .collect()
    }

    /// Components that modify the output of `name`.
    pub fn affected_by(&self, name: &str) -> BTreeSet<&str> {
        self.names(self.index.get(name).map(|&i| &self.affected_by[i]))
            .into_iter()
            .collect()
    }

    /// Components with `role` that affect `name`, e.g. the lights illuminating a camera.
    pub fn affected_by_role(&self, name: &str, role: &Role) -> BTreeSet<&str> {
        self.affected_by(name)
            .into_iter()
            .filter(|source| {
                self.record(source)
                    .map(|record| &record.role == role)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Every component sharing an affects edge with `name`, in either direction.
    pub fn affects_neighbours(&self, name: &str) -> BTreeSet<&str> {
        let mut neighbours = self.affects(name);
        neighbours.extend(self.affected_by(name));
        neighbours
    }

    fn names(&self, indices: Option<&Vec<usize>>) -> Vec<&str> {
        indices
            .map(|indices| {
                indices
                    .iter()
                    .map(|&i| self.records[i].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search with an explicit recursion stack over children edges.
///
/// Returns the members of the first cycle found, each listed once.
fn find_composition_cycle(children: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; children.len()];
    let mut path: Vec<usize> = Vec::new();

    for root in 0..children.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, next child slot to visit)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;
        path.push(root);

        while let Some(frame) = stack.last_mut() {
            let (node, slot) = *frame;
            if let Some(&next) = children[node].get(slot) {
                frame.1 += 1;
                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnStack;
                        path.push(next);
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        return Some(path[start..].to_vec());
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                path.pop();
                stack.pop();
            }
        }
    }
    None
}

/// Kahn's algorithm on child → composite edges, seeded in declaration order.
fn children_first_order(children: &[Vec<usize>], parent: &[Option<usize>]) -> Vec<usize> {
    let mut pending: Vec<usize> = children.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..children.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(children.len());

    while let Some(node) = queue.pop_front() {
        order.push(node);
        if let Some(p) = parent[node] {
            pending[p] = pending[p].saturating_sub(1);
            if pending[p] == 0 {
                queue.push_back(p);
            }
        }
    }
    order
}
