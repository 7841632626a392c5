//! TaskTree - node arena for one run, plus the child window policy

use uuid::Uuid;

use super::types::{TaskInfo, TaskNode, TaskState, now_ms};

/// Default number of children a parent shows
pub const DEFAULT_VISIBLE_CHILDREN: usize = 10;

struct Slot {
    info: TaskInfo,
    children: Vec<u32>,
}

/// All nodes of one run, indexed by sequence id
pub struct RunTree {
    run: Uuid,
    slots: Vec<Slot>,
}

impl RunTree {
    /// New tree holding only the root (sequence 0)
    pub fn new(run: Uuid, title: impl Into<String>, state: TaskState) -> Self {
        let root = TaskInfo {
            uuid: run,
            id: 0,
            parent_id: None,
            title: title.into(),
            state,
            progress: 0,
            total: 0,
            from: None,
            to: None,
            time: now_ms(),
            error: None,
        };
        Self {
            run,
            slots: vec![Slot {
                info: root,
                children: Vec::new(),
            }],
        }
    }

    pub fn run(&self) -> Uuid {
        self.run
    }

    pub fn get(&self, id: u32) -> Option<&TaskInfo> {
        self.slots.get(id as usize).map(|s| &s.info)
    }

    /// Append a child of `parent`, returning its sequence id
    ///
    /// An unknown parent is replaced by the root.
    pub fn add_child(&mut self, parent: u32, title: impl Into<String>, state: TaskState) -> u32 {
        let parent = if (parent as usize) < self.slots.len() { parent } else { 0 };
        let id = self.slots.len() as u32;
        self.slots.push(Slot {
            info: TaskInfo {
                uuid: self.run,
                id,
                parent_id: Some(parent),
                title: title.into(),
                state,
                progress: 0,
                total: 0,
                from: None,
                to: None,
                time: now_ms(),
                error: None,
            },
            children: Vec::new(),
        });
        self.slots[parent as usize].children.push(id);
        id
    }

    /// Mutable access to a node that has not reached a terminal state
    ///
    /// Terminal nodes are frozen: every later change is dropped.
    pub fn live_mut(&mut self, id: u32) -> Option<&mut TaskInfo> {
        let info = &mut self.slots.get_mut(id as usize)?.info;
        if info.state.is_terminal() {
            return None;
        }
        info.time = now_ms();
        Some(info)
    }

    /// Ids of every node that has not reached a terminal state
    pub fn live_ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| !s.info.state.is_terminal())
            .map(|s| s.info.id)
            .collect()
    }

    fn build(&self, slot: &Slot) -> TaskNode {
        TaskNode {
            info: slot.info.clone(),
            children: slot
                .children
                .iter()
                .filter_map(|c| self.slots.get(*c as usize))
                .map(|c| self.build(c))
                .collect(),
        }
    }

    /// Nested view of the subtree under `id`, children in creation order
    pub fn node(&self, id: u32) -> Option<TaskNode> {
        self.slots.get(id as usize).map(|s| self.build(s))
    }

    pub fn root(&self) -> TaskNode {
        self.build(&self.slots[0])
    }
}

/// The children a parent shows: at most `window`, succeeded ones last
///
/// Relative order inside the unfinished and succeeded groups is kept, so a
/// bounded view always surfaces running and failed work first.
pub fn visible_children(children: &[TaskNode], window: usize) -> Vec<&TaskNode> {
    let (done, active): (Vec<&TaskNode>, Vec<&TaskNode>) =
        children.iter().partition(|c| c.info.state == TaskState::Succeed);
    active.into_iter().chain(done).take(window).collect()
}
