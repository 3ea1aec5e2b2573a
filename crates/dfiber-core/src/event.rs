//! I/O interest mask
//!
//! The bit values match the Linux epoll flags (`EPOLLIN` / `EPOLLOUT`) so a
//! mask can be handed to `epoll_ctl` without translation.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Sub};

/// Set of I/O event kinds registered on (or fired by) a file descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    /// No interest
    pub const NONE: Event = Event(0x0);

    /// Readable (`EPOLLIN`)
    pub const READ: Event = Event(0x1);

    /// Writable (`EPOLLOUT`)
    pub const WRITE: Event = Event(0x4);

    /// Keep only the bits that name a known event kind
    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set in `self`
    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set in `self`
    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }

    /// True for `READ` or `WRITE` alone
    #[inline]
    pub const fn is_single(self) -> bool {
        self.0 == Self::READ.0 || self.0 == Self::WRITE.0
    }
}

impl BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Sub for Event {
    type Output = Event;
    fn sub(self, rhs: Event) -> Event {
        Event(self.0 & !rhs.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_set_ops() {
        let both = Event::READ | Event::WRITE;
        assert!(both.contains(Event::READ));
        assert!(both.contains(Event::WRITE));
        assert_eq!(both - Event::READ, Event::WRITE);
        assert_eq!(both & Event::WRITE, Event::WRITE);
        assert!((both - both).is_empty());
        assert!(!Event::READ.intersects(Event::WRITE));
    }

    #[test]
    fn test_event_truncate() {
        // EPOLLERR (0x8) and EPOLLET (1 << 31) are not event kinds
        let ev = Event::from_bits_truncate(0x1 | 0x8 | (1 << 31));
        assert_eq!(ev, Event::READ);
        assert!(ev.is_single());
        assert!(!(Event::READ | Event::WRITE).is_single());
        assert!(!Event::NONE.is_single());
    }

    #[test]
    fn test_event_debug() {
        assert_eq!(format!("{:?}", Event::NONE), "NONE");
        assert_eq!(format!("{:?}", Event::READ | Event::WRITE), "READ|WRITE");
    }
}
