use std::collections::HashSet;

/// Deduplicated element ids kept in first-insertion order.
#[derive(Debug, Clone, Default)]
pub(crate) struct ElementIds {
    order: Vec<String>,
    members: HashSet<String>,
}

impl ElementIds {
    pub(crate) fn insert_all(&mut self, element_ids: &[String]) {
        for id in element_ids {
            if self.members.insert(id.clone()) {
                self.order.push(id.clone());
            }
        }
    }

    pub(crate) fn remove_all(&mut self, element_ids: &[String]) {
        let mut removed = false;
        for id in element_ids {
            removed |= self.members.remove(id);
        }
        if removed {
            self.order.retain(|id| self.members.contains(id));
        }
    }

    pub(crate) fn contains(&self, element_id: &str) -> bool {
        self.members.contains(element_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn to_vec(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Drain every id, leaving the set empty.
    pub(crate) fn take(&mut self) -> Vec<String> {
        self.members.clear();
        std::mem::take(&mut self.order)
    }
}
