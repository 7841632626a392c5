//! TaskMirror - client-side copy of the task trees
//!
//! Seeded from the `task-subscribe` reply and kept current by `task-update`
//! batches. Adds already known are skipped, so the overlap between the
//! subscribe snapshot and the first batch is harmless.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use super::tree::{DEFAULT_VISIBLE_CHILDREN, visible_children};
use super::types::{TaskBatch, TaskInfo, TaskNode};

struct MirrorNode {
    info: TaskInfo,
    children: Vec<u32>,
}

pub struct TaskMirror {
    /// Root runs in arrival order
    roots: Vec<Uuid>,
    nodes: HashMap<(Uuid, u32), MirrorNode>,
    window: usize,
}

impl Default for TaskMirror {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBLE_CHILDREN)
    }
}

impl TaskMirror {
    pub fn new(window: usize) -> Self {
        Self {
            roots: Vec::new(),
            nodes: HashMap::new(),
            window,
        }
    }

    /// Replace everything with a subscribe snapshot
    pub fn reset(&mut self, snapshot: Vec<TaskNode>) {
        debug!(runs = snapshot.len(), "TaskMirror::reset: called");
        self.roots.clear();
        self.nodes.clear();
        for root in snapshot {
            self.insert_tree(root);
        }
    }

    fn insert_tree(&mut self, node: TaskNode) {
        let TaskNode { info, children } = node;
        if !self.insert(info) {
            return;
        }
        for child in children {
            self.insert_tree(child);
        }
    }

    /// Insert one node; false if it was already known
    fn insert(&mut self, info: TaskInfo) -> bool {
        let key = info.key();
        if self.nodes.contains_key(&key) {
            return false;
        }
        match info.parent_id {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(&(info.uuid, parent)) {
                    p.children.push(info.id);
                } else {
                    debug!(uuid = %info.uuid, id = info.id, parent, "TaskMirror: parent unknown");
                }
            }
            None => self.roots.push(info.uuid),
        }
        self.nodes.insert(
            key,
            MirrorNode {
                info,
                children: Vec::new(),
            },
        );
        true
    }

    /// Apply one `task-update` push
    pub fn apply(&mut self, batch: &TaskBatch) {
        for add in &batch.adds {
            let info = TaskInfo {
                uuid: add.uuid,
                id: add.id,
                parent_id: add.parent_id,
                title: add.title.clone(),
                state: add.state,
                progress: 0,
                total: 0,
                from: add.from.clone(),
                to: add.to.clone(),
                time: add.time,
                error: None,
            };
            if !self.insert(info) {
                debug!(uuid = %add.uuid, id = add.id, "TaskMirror: duplicate add skipped");
            }
        }
        for update in &batch.updates {
            match self.nodes.get_mut(&update.key()) {
                Some(node) => update.apply_to(&mut node.info),
                None => debug!(uuid = %update.uuid, id = update.id, "TaskMirror: update for unknown node"),
            }
        }
    }

    pub fn get(&self, uuid: Uuid, id: u32) -> Option<&TaskInfo> {
        self.nodes.get(&(uuid, id)).map(|n| &n.info)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn build(&self, uuid: Uuid, id: u32) -> Option<TaskNode> {
        let node = self.nodes.get(&(uuid, id))?;
        let children: Vec<TaskNode> = node.children.iter().filter_map(|c| self.build(uuid, *c)).collect();
        let children = visible_children(&children, self.window).into_iter().cloned().collect();
        Some(TaskNode {
            info: node.info.clone(),
            children,
        })
    }

    /// Every run as a tree, each parent limited to its visible children window
    pub fn view(&self) -> Vec<TaskNode> {
        self.roots.iter().filter_map(|uuid| self.build(*uuid, 0)).collect()
    }
}
