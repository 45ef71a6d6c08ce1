// gallium/gpu/src/reference.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::mem;
use std::sync::Arc;

/// Points `slot` at `new` and releases whatever it pointed at before.
///
/// Returns true if that release dropped the last reference, in which case the old object has
/// been destroyed (its `Drop` has run) by the time this returns. Rebinding the object already
/// in the slot changes nothing.
pub fn reference<T>(slot: &mut Option<Arc<T>>, new: Option<&Arc<T>>) -> bool {
    if let (Some(old), Some(new)) = (slot.as_ref(), new) {
        if Arc::ptr_eq(old, new) {
            return false;
        }
    }

    match mem::replace(slot, new.cloned()) {
        None => false,
        Some(old) => Arc::into_inner(old).is_some(),
    }
}

#[cfg(test)]
mod test {
    use quickcheck;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::reference;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rebinding_same_object_is_a_no_op() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let object = Arc::new(Tracked(destroyed.clone()));
        let mut slot = Some(object.clone());
        assert!(!reference(&mut slot, Some(&object)));
        assert_eq!(Arc::strong_count(&object), 2);
        drop(object);
        assert!(reference(&mut slot, None));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destroyed_exactly_once_when_count_reaches_zero() {
        quickcheck::quickcheck(prop_single_destroy as fn(u8, Vec<(u8, bool)>) -> bool);

        fn prop_single_destroy(owner_count: u8, ops: Vec<(u8, bool)>) -> bool {
            let owner_count = owner_count as usize % 8 + 1;
            let destroyed = Arc::new(AtomicUsize::new(0));
            let mut owners: Vec<Option<Arc<Tracked>>> = vec![None; owner_count];
            owners[0] = Some(Arc::new(Tracked(destroyed.clone())));
            let mut signalled = 0;

            for (owner, acquire) in ops {
                let owner = owner as usize % owner_count;
                let last = if acquire {
                    // The temporary owner must be gone before any release below.
                    match owners.iter().flatten().next().cloned() {
                        Some(source) => reference(&mut owners[owner], Some(&source)),
                        None => false,
                    }
                } else {
                    reference(&mut owners[owner], None)
                };
                if last {
                    signalled += 1;
                }
                let alive = owners.iter().any(|slot| slot.is_some());
                let expected = if alive { 0 } else { 1 };
                if destroyed.load(Ordering::SeqCst) != expected {
                    return false;
                }
            }

            let alive = owners.iter().any(|slot| slot.is_some());
            signalled == if alive { 0 } else { 1 }
        }
    }
}
