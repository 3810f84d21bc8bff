//! Inode numbers for the kernel interface.
//!
//! Object ids are opaque strings; the kernel wants stable u64 inodes. The
//! map hands out inodes on first sight and keeps them for the life of the
//! mount. Inode 1 is the synthetic root.

use crate::object::ROOT_ID;
use std::collections::HashMap;

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub struct InodeMap {
    by_ino: HashMap<u64, String>,
    by_id: HashMap<String, u64>,
    next: u64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut map = Self {
            by_ino: HashMap::new(),
            by_id: HashMap::new(),
            next: ROOT_INO + 1,
        };
        map.by_ino.insert(ROOT_INO, ROOT_ID.to_owned());
        map.by_id.insert(ROOT_ID.to_owned(), ROOT_INO);
        map
    }

    pub fn get_or_assign(&mut self, id: &str) -> u64 {
        if let Some(&ino) = self.by_id.get(id) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, id.to_owned());
        self.by_id.insert(id.to_owned(), ino);
        ino
    }

    pub fn id_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    pub fn forget(&mut self, id: &str) {
        if let Some(ino) = self.by_id.remove(id) {
            self.by_ino.remove(&ino);
        }
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_ino_one() {
        let map = InodeMap::new();
        assert_eq!(map.id_of(ROOT_INO), Some(ROOT_ID));
    }

    #[test]
    fn inodes_are_stable_per_id() {
        let mut map = InodeMap::new();
        let a = map.get_or_assign("file-1");
        let b = map.get_or_assign("file-2");
        assert_ne!(a, b);
        assert_eq!(map.get_or_assign("file-1"), a);
        map.forget("file-1");
        assert_eq!(map.id_of(a), None);
        // a forgotten id gets a fresh inode
        assert_ne!(map.get_or_assign("file-1"), a);
    }
}
