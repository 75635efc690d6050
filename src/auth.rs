use std::collections::HashSet;

use crate::codec::{ClientId, InvalidClientId};

/// Identity tokens allowed to open tunnels. Built once, never mutated.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    ids: HashSet<ClientId>,
}

impl AllowList {
    /// Parses a comma-separated token list; blank entries are skipped.
    pub fn parse(list: &str) -> Result<Self, InvalidClientId> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::parse::<ClientId>)
            .collect::<Result<HashSet<_>, _>>()
            .map(|ids| Self { ids })
    }

    #[must_use]
    pub fn is_authorized(&self, id: &ClientId) -> bool {
        self.ids.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<ClientId> for AllowList {
    fn from_iter<I: IntoIterator<Item = ClientId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
