//! Shadow virtual-table hooking.
//!
//! The first hook on an instance copies that instance's function-pointer
//! table into a shadow table and swaps the instance's table pointer; later
//! hooks on the same instance share the shadow and only overwrite their
//! slot (last writer wins per slot). The original table pointer goes back
//! only when the last hook on the instance is removed.
//!
//! Calling-convention contracts per slot are a property of the hooked
//! object and are supplied by the caller; the registry stores opaque
//! function-pointer words and never invokes them.

use crate::hook::Hook;
use crate::types::HookError;
use core::ffi::c_void;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

struct ShadowTable {
    original_vptr: usize,
    table: Box<[usize]>,
    hook_count: usize,
}

static SHADOWS: Mutex<Option<HashMap<usize, ShadowTable>>> = Mutex::new(None);

pub struct VtableHook {
    instance: usize,
    slot: usize,
    /// Slot value displaced by this hook (the "original" to call through).
    original: usize,
}

unsafe impl Send for VtableHook {}
unsafe impl Sync for VtableHook {}

impl VtableHook {
    /// Hook `slot` of the table `instance` dispatches through.
    ///
    /// # Safety
    /// `instance` must point to an object whose first word is a pointer to
    /// a table of at least `table_size` function pointers, and the object
    /// must outlive the hook. `callback` must match the slot's calling
    /// convention.
    pub unsafe fn install(
        instance: *mut c_void,
        slot: usize,
        callback: *const c_void,
        table_size: usize,
    ) -> Result<Self, HookError> {
        if instance.is_null() {
            return Err(HookError::InvalidArgument("null instance"));
        }
        if callback.is_null() {
            return Err(HookError::InvalidArgument("null callback"));
        }
        if table_size == 0 {
            return Err(HookError::InvalidArgument("zero-sized table"));
        }
        if slot >= table_size {
            return Err(HookError::InvalidArgument("slot index beyond table size"));
        }

        let key = instance as usize;
        let mut guard = SHADOWS.lock().unwrap_or_else(|e| e.into_inner());
        let map = guard.get_or_insert_with(HashMap::new);

        let shadow = match map.entry(key) {
            Entry::Occupied(entry) => {
                let shadow = entry.into_mut();
                // A later hook may not assume a larger table than the
                // shadow that is already dispatching for this instance.
                if slot >= shadow.table.len() {
                    return Err(HookError::InvalidArgument("slot beyond existing shadow table"));
                }
                shadow
            }
            Entry::Vacant(entry) => {
                let vptr = *(instance as *const usize);
                if vptr == 0 {
                    return Err(HookError::InvalidArgument("instance has null table pointer"));
                }
                let mut table = Vec::with_capacity(table_size);
                for i in 0..table_size {
                    table.push(*((vptr + i * core::mem::size_of::<usize>()) as *const usize));
                }
                let table = table.into_boxed_slice();
                // Swap the instance onto the shadow; the Box allocation is
                // stable for the shadow's lifetime.
                *(instance as *mut usize) = table.as_ptr() as usize;
                log::debug!("shadow table installed for instance {key:#x} ({table_size} slots)");
                entry.insert(ShadowTable {
                    original_vptr: vptr,
                    table,
                    hook_count: 0,
                })
            }
        };

        let original = shadow.table[slot];
        shadow.table[slot] = callback as usize;
        shadow.hook_count += 1;

        Ok(Self {
            instance: key,
            slot,
            original,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Hook for VtableHook {
    fn location(&self) -> usize {
        self.original
    }
}

impl Drop for VtableHook {
    fn drop(&mut self) {
        let mut guard = SHADOWS.lock().unwrap_or_else(|e| e.into_inner());
        let Some(map) = guard.as_mut() else { return };
        let Some(shadow) = map.get_mut(&self.instance) else { return };

        shadow.table[self.slot] = self.original;
        shadow.hook_count -= 1;
        if shadow.hook_count == 0 {
            // SAFETY: the installer's contract requires the instance to
            // outlive its hooks.
            unsafe {
                *(self.instance as *mut usize) = shadow.original_vptr;
            }
            map.remove(&self.instance);
            log::debug!("shadow table removed for instance {:#x}", self.instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type SlotFn = extern "C" fn() -> i32;

    extern "C" fn slot0() -> i32 {
        10
    }
    extern "C" fn slot1() -> i32 {
        11
    }
    extern "C" fn slot2() -> i32 {
        12
    }
    extern "C" fn hooked1() -> i32 {
        101
    }
    extern "C" fn hooked2() -> i32 {
        102
    }

    /// An object dispatching through a table pointer in its first word,
    /// the way a C++ polymorphic object does.
    #[repr(C)]
    struct Widget {
        vptr: *const usize,
        table: Box<[usize; 3]>,
    }

    impl Widget {
        fn new() -> Box<Self> {
            let table = Box::new([slot0 as usize, slot1 as usize, slot2 as usize]);
            let mut w = Box::new(Widget {
                vptr: core::ptr::null(),
                table,
            });
            w.vptr = w.table.as_ptr();
            w
        }

        fn call(&self, slot: usize) -> i32 {
            unsafe {
                let entry = *self.vptr.add(slot);
                let f: SlotFn = core::mem::transmute(entry);
                f()
            }
        }
    }

    #[test]
    fn hooked_slot_dispatches_callback_and_others_are_untouched() {
        let mut w = Widget::new();
        let original_vptr = w.vptr;
        assert_eq!(w.call(1), 11);

        let instance = &mut *w as *mut Widget as *mut c_void;
        let hook = unsafe { VtableHook::install(instance, 1, hooked1 as *const c_void, 3) }
            .expect("install");

        assert_ne!(w.vptr, original_vptr, "instance must dispatch through the shadow");
        assert_eq!(w.call(1), 101);
        assert_eq!(w.call(0), 10);
        assert_eq!(w.call(2), 12);

        // `location()` is the displaced entry: the original function.
        let original: SlotFn = unsafe { core::mem::transmute(hook.location()) };
        assert_eq!(original(), 11);

        drop(hook);
        assert_eq!(w.vptr, original_vptr, "last hook removal restores the table pointer");
        assert_eq!(w.call(1), 11);
    }

    #[test]
    fn hooks_on_one_instance_share_a_shadow_and_unhook_independently() {
        let mut w = Widget::new();
        let original_vptr = w.vptr;
        let instance = &mut *w as *mut Widget as *mut c_void;

        let h1 = unsafe { VtableHook::install(instance, 1, hooked1 as *const c_void, 3) }
            .expect("first hook");
        let shadow_vptr = w.vptr;
        let h2 = unsafe { VtableHook::install(instance, 2, hooked2 as *const c_void, 3) }
            .expect("second hook");

        assert_eq!(w.vptr, shadow_vptr, "second hook reuses the first hook's shadow");
        assert_eq!(w.call(1), 101);
        assert_eq!(w.call(2), 102);

        drop(h1);
        assert_eq!(w.call(1), 11, "removed hook's slot is restored");
        assert_eq!(w.call(2), 102, "sibling hook keeps its slot");
        assert_eq!(w.vptr, shadow_vptr, "shadow stays while hooks remain");

        drop(h2);
        assert_eq!(w.vptr, original_vptr);
        assert_eq!(w.call(2), 12);
    }

    #[test]
    fn same_slot_hooks_chain_through_location() {
        let mut w = Widget::new();
        let instance = &mut *w as *mut Widget as *mut c_void;

        let h1 = unsafe { VtableHook::install(instance, 0, hooked1 as *const c_void, 3) }
            .expect("first");
        let h2 = unsafe { VtableHook::install(instance, 0, hooked2 as *const c_void, 3) }
            .expect("second");

        assert_eq!(w.call(0), 102, "last writer wins on the live slot");
        assert_eq!(h1.location(), slot0 as usize);
        assert_eq!(h2.location(), hooked1 as usize, "second hook displaced the first");

        drop(h2);
        assert_eq!(w.call(0), 101);
        drop(h1);
        assert_eq!(w.call(0), 10);
    }

    #[test]
    fn rejects_degenerate_arguments() {
        let mut w = Widget::new();
        let instance = &mut *w as *mut Widget as *mut c_void;
        unsafe {
            assert!(VtableHook::install(core::ptr::null_mut(), 0, hooked1 as *const c_void, 3).is_err());
            assert!(VtableHook::install(instance, 3, hooked1 as *const c_void, 3).is_err());
            assert!(VtableHook::install(instance, 0, core::ptr::null(), 3).is_err());
            assert!(VtableHook::install(instance, 0, hooked1 as *const c_void, 0).is_err());
        }
    }
}
