//! Process-wide interruption flag raised from signal handlers.
//!
//! The flag only ever climbs: `None -> Int -> Term`. `Int` means "cancel
//! the current request, keep running"; `Term` means "finish the current
//! request, then exit". Clearing lowers `Int` back to `None` but never
//! touches `Term`.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Interruption {
    None = 0,
    Int = 1,
    Term = 2,
}

static IRQ: AtomicU8 = AtomicU8::new(Interruption::None as u8);

fn decode(v: u8) -> Interruption {
    match v {
        1 => Interruption::Int,
        2 => Interruption::Term,
        _ => Interruption::None,
    }
}

/// Raise the flag to at least `level`. Elevation is monotone; a concurrent
/// higher level wins. Async-signal-safe (a CAS loop on one atomic).
pub fn raise(level: Interruption) {
    debug_assert!(level != Interruption::None);
    let mut cur = IRQ.load(Ordering::Relaxed);
    while level as u8 > cur {
        match IRQ.compare_exchange_weak(cur, level as u8, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(seen) => cur = seen,
        }
    }
}

/// Lower `Int` back to `None`. `Term` is sticky.
pub fn clear() {
    let _ = IRQ.compare_exchange(
        Interruption::Int as u8,
        Interruption::None as u8,
        Ordering::Relaxed,
        Ordering::Relaxed,
    );
}

pub fn current() -> Interruption {
    decode(IRQ.load(Ordering::Relaxed))
}

pub fn requested() -> bool {
    current() != Interruption::None
}

#[cfg(test)]
mod tests {
    use super::*;

    // The flag is process-global, so exercise the whole protocol in a
    // single test to avoid ordering issues between tests.
    #[test]
    fn elevation_is_monotone_and_clear_only_lowers_int() {
        assert_eq!(current(), Interruption::None);

        raise(Interruption::Int);
        assert_eq!(current(), Interruption::Int);

        clear();
        assert_eq!(current(), Interruption::None);

        raise(Interruption::Int);
        raise(Interruption::Term);
        assert_eq!(current(), Interruption::Term);

        // Cannot go back down.
        raise(Interruption::Int);
        assert_eq!(current(), Interruption::Term);
        clear();
        assert_eq!(current(), Interruption::Term);
        assert!(requested());
    }
}
