//! Allocation and the mark-and-sweep collector.
//!
//! Every heap object is allocated through [`Heap::alloc`] (the `Box` +
//! intrusive-list-link choke point standing in for the original's single
//! `reallocate(ptr, old_size, new_size)` function — Rust's allocator
//! already handles resizing for the few growable fields objects have, so
//! the one thing worth centralizing here is bytes-accounting and
//! threading new objects onto the heap's object list) and tracked in
//! `bytes_allocated`.
//!
//! Collection itself has two owners, since this crate has no global `Vm`
//! singleton to hang a single `markRoots` off of (§9): [`crate::vm::Vm`]
//! marks its own root set (stack, frames, globals, open upvalues) and
//! [`crate::compiler::Compiler`] marks its own (the in-progress function
//! chain), each calling [`Heap::collect_garbage`] for the shared
//! mark-extra-roots/trace/sweep tail. `extra_roots` is the handoff
//! between the two: before handing a `Heap` to the compiler, `Vm::interpret`
//! dumps its whole root set in here so a collection triggered mid-compile
//! (stress mode, or a REPL line that pushes the heap over threshold)
//! doesn't sweep away state from a previous REPL line.

use std::ptr::NonNull;

use crate::table::{fnv1a_hash, Table};
use crate::value::{
    ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjNative, ObjRef,
    ObjString, ObjType, ObjUpvalue, UpvalueLocation, Value,
};

const HEAP_GROWTH_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

pub struct Heap {
    objects: Option<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub gray_stack: Vec<ObjRef>,
    /// The string intern set (used as a set: values are unused sentinels).
    pub strings: Table,
    /// Forces a collection before every allocation when set (`--gc-stress`).
    pub stress: bool,
    /// Extra roots supplied by whoever is driving a collection, on top of
    /// whatever that driver marks directly (see module docs).
    extra_roots: Vec<ObjRef>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            gray_stack: Vec::new(),
            strings: Table::new(),
            stress: false,
            extra_roots: Vec::new(),
        }
    }

    /// Registers `obj` as a root until [`Heap::clear_roots`] is called.
    pub fn push_root(&mut self, obj: ObjRef) {
        self.extra_roots.push(obj);
    }

    pub fn clear_roots(&mut self) {
        self.extra_roots.clear();
    }

    /// `true` when the allocator-triggered collection threshold (or the
    /// stress flag) says a collection should run before the next
    /// allocation is satisfied.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn adjust_threshold(&mut self) {
        self.next_gc = self.bytes_allocated * HEAP_GROWTH_FACTOR;
    }

    fn link(&mut self, header_ptr: NonNull<ObjHeader>) -> ObjRef {
        // SAFETY: `header_ptr` was just produced by `Box::into_raw` on a
        // fully-initialized object whose first field is `ObjHeader`.
        let obj = unsafe { ObjRef::from_raw(header_ptr) };
        obj.set_next(self.objects);
        self.objects = Some(obj);
        obj
    }

    fn alloc<T>(&mut self, value: T) -> NonNull<ObjHeader> {
        self.bytes_allocated += std::mem::size_of::<T>();
        let boxed = Box::into_raw(Box::new(value));
        // SAFETY: `T` always starts with `ObjHeader` (enforced by every
        // concrete object type being `#[repr(C)]` with `header` first).
        unsafe { NonNull::new_unchecked(boxed as *mut ObjHeader) }
    }

    fn header(tag: ObjType) -> ObjHeader {
        ObjHeader { tag, is_marked: false, next: None }
    }

    pub fn alloc_string_raw(&mut self, chars: Box<str>, hash: u32) -> ObjRef {
        let ptr = self.alloc(ObjString { header: Self::header(ObjType::String), hash, chars });
        self.link(ptr)
    }

    /// `copy_string`: interns a byte sequence, copying it if not already
    /// present.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = fnv1a_hash(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        let obj = self.alloc_string_raw(chars.into(), hash);
        self.strings.set(obj, Value::Nil);
        obj
    }

    /// `take_string`: interns an owned `String`, reusing the existing
    /// interned object (and dropping the incoming buffer) if one exists.
    pub fn intern_owned(&mut self, chars: String) -> ObjRef {
        let hash = fnv1a_hash(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(&chars, hash) {
            return existing;
        }
        let obj = self.alloc_string_raw(chars.into_boxed_str(), hash);
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn alloc_function(&mut self, function: ObjFunction) -> ObjRef {
        let ptr = self.alloc(function);
        self.link(ptr)
    }

    pub fn alloc_native(&mut self, name: &'static str, function: crate::value::NativeFn) -> ObjRef {
        let ptr = self.alloc(ObjNative { header: Self::header(ObjType::Native), name, function });
        self.link(ptr)
    }

    pub fn alloc_closure(&mut self, function: ObjRef, upvalues: Vec<ObjRef>) -> ObjRef {
        let ptr = self.alloc(ObjClosure { header: Self::header(ObjType::Closure), function, upvalues });
        self.link(ptr)
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let ptr = self.alloc(ObjUpvalue {
            header: Self::header(ObjType::Upvalue),
            location: UpvalueLocation::Open(stack_index),
            next_open: None,
        });
        self.link(ptr)
    }

    pub fn alloc_class(&mut self, name: ObjRef) -> ObjRef {
        let ptr = self.alloc(ObjClass { header: Self::header(ObjType::Class), name, methods: Table::new() });
        self.link(ptr)
    }

    pub fn alloc_instance(&mut self, class: ObjRef) -> ObjRef {
        let ptr = self.alloc(ObjInstance { header: Self::header(ObjType::Instance), class, fields: Table::new() });
        self.link(ptr)
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        let ptr = self.alloc(ObjBoundMethod { header: Self::header(ObjType::BoundMethod), receiver, method });
        self.link(ptr)
    }

    // --- Mark / trace / sweep primitives ---

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        if obj.is_marked() {
            return;
        }
        obj.set_marked(true);
        self.gray_stack.push(obj);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, blackening each object by marking its
    /// outgoing references (§4.5 step 2).
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        match obj.tag() {
            ObjType::String | ObjType::Native => {}
            ObjType::Function => {
                let function = obj.as_function();
                if let Some(name) = function.name {
                    self.mark_object(name);
                }
                for &constant in &function.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjType::Closure => {
                let closure = obj.as_closure();
                self.mark_object(closure.function);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue);
                }
            }
            ObjType::Upvalue => {
                if let UpvalueLocation::Closed(v) = obj.as_upvalue().location {
                    self.mark_value(v);
                }
            }
            ObjType::Class => {
                let class = obj.as_class();
                self.mark_object(class.name);
                self.mark_table(&class.methods);
            }
            ObjType::Instance => {
                let instance = obj.as_instance();
                self.mark_object(instance.class);
                self.mark_table(&instance.fields);
            }
            ObjType::BoundMethod => {
                let bound = obj.as_bound_method();
                self.mark_value(bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    /// Drops every interned string whose mark bit is clear, keeping the
    /// intern table from keeping otherwise-garbage strings alive.
    pub fn remove_white_strings(&mut self) {
        self.strings.remove_white();
    }

    /// Marks `extra_roots`, drains the gray stack, removes unreached
    /// interned strings, sweeps, and grows the threshold.
    ///
    /// Callers own the rest of the root set: mark it *before* calling
    /// this (see module docs — `Vm` marks its stack/frames/globals,
    /// `Compiler` marks its function chain).
    pub fn collect_garbage(&mut self) {
        tracing::debug!(target: "gc", bytes_allocated = self.bytes_allocated, "gc begin");
        let roots = std::mem::take(&mut self.extra_roots);
        for obj in &roots {
            self.mark_object(*obj);
        }
        self.extra_roots = roots;
        self.trace_references();
        self.remove_white_strings();
        let freed = self.sweep();
        self.adjust_threshold();
        tracing::debug!(target: "gc", freed, bytes_allocated = self.bytes_allocated, "gc end");
    }

    /// Walks the object list, freeing every unmarked object and clearing
    /// the mark bit on survivors. Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: Option<ObjRef> = None;
        let mut current = self.objects;

        while let Some(obj) = current {
            if obj.is_marked() {
                obj.set_marked(false);
                previous = Some(obj);
                current = obj.next();
            } else {
                let unreached = obj;
                current = obj.next();
                if let Some(prev) = previous {
                    prev.set_next(current);
                } else {
                    self.objects = current;
                }
                self.bytes_allocated -= unsafe { free_object(unreached) };
                freed += 1;
            }
        }
        freed
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects.take();
        while let Some(obj) = current {
            current = obj.next();
            unsafe {
                free_object(obj);
            }
        }
    }
}

/// Reconstructs the owning `Box` for `obj` based on its tag and drops it,
/// running every field's destructor (the `Table`s, `Vec`s, and boxed
/// strings each concrete object type owns).
///
/// # Safety
/// `obj` must not be referenced again after this call.
unsafe fn free_object(obj: ObjRef) -> usize {
    let ptr = obj.as_ptr();
    match obj.tag() {
        ObjType::String => {
            let size = std::mem::size_of::<ObjString>();
            drop(Box::from_raw(ptr as *mut ObjString));
            size
        }
        ObjType::Function => {
            let size = std::mem::size_of::<ObjFunction>();
            drop(Box::from_raw(ptr as *mut ObjFunction));
            size
        }
        ObjType::Native => {
            let size = std::mem::size_of::<ObjNative>();
            drop(Box::from_raw(ptr as *mut ObjNative));
            size
        }
        ObjType::Closure => {
            let size = std::mem::size_of::<ObjClosure>();
            drop(Box::from_raw(ptr as *mut ObjClosure));
            size
        }
        ObjType::Upvalue => {
            let size = std::mem::size_of::<ObjUpvalue>();
            drop(Box::from_raw(ptr as *mut ObjUpvalue));
            size
        }
        ObjType::Class => {
            let size = std::mem::size_of::<ObjClass>();
            drop(Box::from_raw(ptr as *mut ObjClass));
            size
        }
        ObjType::Instance => {
            let size = std::mem::size_of::<ObjInstance>();
            drop(Box::from_raw(ptr as *mut ObjInstance));
            size
        }
        ObjType::BoundMethod => {
            let size = std::mem::size_of::<ObjBoundMethod>();
            drop(Box::from_raw(ptr as *mut ObjBoundMethod));
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn test_intern_distinguishes_different_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("world");
        assert_ne!(a, b);
    }

    #[test]
    fn test_mark_and_sweep_collects_unreachable() {
        let mut heap = Heap::new();
        let a = heap.intern("kept");
        heap.mark_object(a);
        let _unreached = heap.intern("garbage");
        heap.trace_references();
        heap.remove_white_strings();
        let freed = heap.sweep();
        assert_eq!(freed, 1);
        assert!(heap.strings.find_string("kept", fnv1a_hash(b"kept")).is_some());
        assert!(heap.strings.find_string("garbage", fnv1a_hash(b"garbage")).is_none());
    }
}
