//! Bookkeeping of the connections multiplexed by the listener
//!
//! Entries are keyed by raw file descriptor and visited in ascending order.
//! The set tracks its high-water mark: the greatest registered descriptor, never
//! lower than the listening socket's. The listener reports it with every
//! accept and close.

use std::collections::BTreeMap;
use std::os::fd::RawFd;

#[derive(Debug)]
pub struct DescriptorSet<C> {
    listen_fd: RawFd,
    max_fd: RawFd,
    entries: BTreeMap<RawFd, C>,
}

impl<C> DescriptorSet<C> {
    pub fn new(listen_fd: RawFd) -> Self {
        Self {
            listen_fd,
            max_fd: listen_fd,
            entries: BTreeMap::new(),
        }
    }

    /// Register a connection, returning any entry it replaces
    pub fn add(&mut self, fd: RawFd, conn: C) -> Option<C> {
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        self.entries.insert(fd, conn)
    }

    /// Unregister a connection
    pub fn remove(&mut self, fd: RawFd) -> Option<C> {
        let conn = self.entries.remove(&fd);
        if fd == self.max_fd {
            self.compact();
        }
        conn
    }

    /// Recompute the high-water mark from the remaining entries
    pub fn compact(&mut self) {
        self.max_fd = self
            .entries
            .keys()
            .next_back()
            .copied()
            .map_or(self.listen_fd, |fd| fd.max(self.listen_fd));
    }

    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    pub fn listen_fd(&self) -> RawFd {
        self.listen_fd
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut C> {
        self.entries.get_mut(&fd)
    }

    /// Registered descriptors in ascending order
    pub fn fds(&self) -> Vec<RawFd> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &C)> {
        self.entries.iter().map(|(fd, conn)| (*fd, conn))
    }

    /// Remove every connection, lowest descriptor first
    pub fn drain(&mut self) -> Vec<(RawFd, C)> {
        let entries = std::mem::take(&mut self.entries);
        self.max_fd = self.listen_fd;
        entries.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_water_mark_follows_highest_fd() {
        let mut set = DescriptorSet::new(3);
        assert_eq!(set.max_fd(), 3);

        set.add(5, "a");
        set.add(9, "b");
        set.add(7, "c");
        assert_eq!(set.max_fd(), 9);

        assert_eq!(set.remove(9), Some("b"));
        assert_eq!(set.max_fd(), 7);

        // Removing a lower fd leaves the mark alone
        set.remove(5);
        assert_eq!(set.max_fd(), 7);

        set.remove(7);
        assert_eq!(set.max_fd(), 3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_ascending_iteration() {
        let mut set = DescriptorSet::new(3);
        for fd in [12, 4, 8] {
            set.add(fd, fd * 10);
        }
        assert_eq!(set.fds(), vec![4, 8, 12]);
        let values: Vec<i32> = set.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![40, 80, 120]);
    }

    #[test]
    fn test_remove_unknown_fd() {
        let mut set: DescriptorSet<()> = DescriptorSet::new(3);
        set.add(6, ());
        assert_eq!(set.remove(4), None);
        assert_eq!(set.max_fd(), 6);
        assert!(set.contains(6));
    }

    #[test]
    fn test_drain_resets_mark() {
        let mut set = DescriptorSet::new(3);
        set.add(10, 'x');
        set.add(4, 'y');
        let drained = set.drain();
        assert_eq!(drained, vec![(4, 'y'), (10, 'x')]);
        assert_eq!(set.max_fd(), 3);
        assert_eq!(set.len(), 0);
    }
}
