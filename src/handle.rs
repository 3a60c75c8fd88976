// Handle table - typed small-integer names for registry records
//
// A handle packs a slot index (low 16 bits) and the slot's generation
// (high 16 bits) into a u32. Each kind of object lives in its own table,
// so a buffer handle can never resolve inside the device table.

use crate::error::{GpuError, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker trait for handle kinds
pub trait HandleKind: 'static {
    const NAME: &'static str;
}

/// Zero-sized kind markers
pub mod kind {
    use super::HandleKind;

    macro_rules! kinds {
        ($($name:ident => $label:literal),* $(,)?) => {
            $(
                #[derive(Debug)]
                pub enum $name {}
                impl HandleKind for $name {
                    const NAME: &'static str = $label;
                }
            )*
        };
    }

    kinds! {
        Instance => "instance",
        PhysicalDevice => "physical device",
        Device => "device",
        Queue => "queue",
        Swapchain => "swapchain",
        Memory => "memory",
        MemoryInfo => "memory info",
        Buffer => "buffer",
        Image => "image",
        Shader => "shader",
        Pipeline => "pipeline",
        CommandPool => "command pool",
    }
}

/// Opaque typed handle
pub struct Handle<K> {
    raw: u32,
    _kind: PhantomData<fn() -> K>,
}

pub type InstanceHandle = Handle<kind::Instance>;
pub type PhysicalDeviceHandle = Handle<kind::PhysicalDevice>;
pub type DeviceHandle = Handle<kind::Device>;
pub type QueueHandle = Handle<kind::Queue>;
pub type SwapchainHandle = Handle<kind::Swapchain>;
pub type MemoryHandle = Handle<kind::Memory>;
pub type MemoryInfoHandle = Handle<kind::MemoryInfo>;
pub type BufferHandle = Handle<kind::Buffer>;
pub type ImageHandle = Handle<kind::Image>;
pub type ShaderHandle = Handle<kind::Shader>;
pub type PipelineHandle = Handle<kind::Pipeline>;
pub type CommandPoolHandle = Handle<kind::CommandPool>;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Index 0xFFFF is never handed out, which keeps `NULL` unresolvable
const MAX_SLOTS: usize = INDEX_MASK as usize;

impl<K> Handle<K> {
    /// "No handle" / "not yet created"
    pub const NULL: Self = Self {
        raw: u32::MAX,
        _kind: PhantomData,
    };

    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    fn new(index: u16, generation: u16) -> Self {
        Self::from_raw(((generation as u32) << INDEX_BITS) | index as u32)
    }

    pub const fn raw(self) -> u32 {
        self.raw
    }

    pub const fn is_null(self) -> bool {
        self.raw == u32::MAX
    }

    fn index(self) -> usize {
        (self.raw & INDEX_MASK) as usize
    }

    fn generation(self) -> u16 {
        (self.raw >> INDEX_BITS) as u16
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::NULL
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "{}(null)", K::NAME)
        } else {
            write!(f, "{}({}v{})", K::NAME, self.index(), self.generation())
        }
    }
}

struct Entry<T> {
    value: T,
    refs: u32,
}

struct Slot<T> {
    generation: u16,
    entry: Option<Entry<T>>,
}

/// Per-kind table of records addressed by `Handle<K>`.
///
/// `refs` counts dependents (records built on top of this one, or frames
/// in flight that use it). A record can only be released at zero refs, and
/// its slot is only recycled after that release, with a new generation.
pub struct HandleTable<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    live: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HandleKind, T> HandleTable<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _kind: PhantomData,
        }
    }

    fn invalid(handle: Handle<K>) -> GpuError {
        GpuError::InvalidHandle {
            kind: K::NAME,
            raw: handle.raw(),
        }
    }

    /// Store a record and hand out a fresh handle for it
    pub fn allocate(&mut self, value: T) -> Result<Handle<K>> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(GpuError::HandleSpaceExhausted(K::NAME));
                }
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u16
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry { value, refs: 0 });
        self.live += 1;
        Ok(Handle::new(index, slot.generation))
    }

    fn entry(&self, handle: Handle<K>) -> Result<&Entry<T>> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| Self::invalid(handle))
    }

    fn entry_mut(&mut self, handle: Handle<K>) -> Result<&mut Entry<T>> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_mut())
            .ok_or_else(|| Self::invalid(handle))
    }

    pub fn resolve(&self, handle: Handle<K>) -> Result<&T> {
        self.entry(handle).map(|entry| &entry.value)
    }

    pub fn resolve_mut(&mut self, handle: Handle<K>) -> Result<&mut T> {
        self.entry_mut(handle).map(|entry| &mut entry.value)
    }

    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.entry(handle).is_ok()
    }

    /// Register one more dependent
    pub fn retain(&mut self, handle: Handle<K>) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one dependent, returning the remaining count
    pub fn unretain(&mut self, handle: Handle<K>) -> Result<u32> {
        let entry = self.entry_mut(handle)?;
        debug_assert!(entry.refs > 0, "unbalanced unretain on {:?}", handle);
        entry.refs = entry.refs.saturating_sub(1);
        Ok(entry.refs)
    }

    pub fn refs(&self, handle: Handle<K>) -> Result<u32> {
        self.entry(handle).map(|entry| entry.refs)
    }

    /// Remove a record with no remaining dependents
    pub fn release(&mut self, handle: Handle<K>) -> Result<T> {
        let refs = self.entry(handle)?.refs;
        if refs > 0 {
            return Err(GpuError::StillReferenced {
                kind: K::NAME,
                refs,
            });
        }

        let index = handle.index();
        let slot = &mut self.slots[index];
        let entry = slot.entry.take().ok_or_else(|| Self::invalid(handle))?;
        self.live -= 1;

        // Exhausted generations retire the slot for good
        if slot.generation < u16::MAX {
            slot.generation += 1;
            self.free.push(index as u16);
        }

        Ok(entry.value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// How many more records fit before `HandleSpaceExhausted`
    pub fn vacancies(&self) -> usize {
        self.free.len() + (MAX_SLOTS - self.slots.len())
    }

    /// Fail early when `count` more records would not fit
    pub fn reserve(&self, count: usize) -> Result<()> {
        if self.vacancies() < count {
            return Err(GpuError::HandleSpaceExhausted(K::NAME));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn handles(&self) -> Vec<Handle<K>> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|entry| (Handle::new(index as u16, slot.generation), &entry.value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<K>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry
                .as_mut()
                .map(|entry| (Handle::new(index as u16, generation), &mut entry.value))
        })
    }

    /// Remove every record regardless of refs (teardown only)
    pub fn drain(&mut self) -> Vec<(Handle<K>, T)> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                out.push((Handle::new(index as u16, slot.generation), entry.value));
                if slot.generation < u16::MAX {
                    slot.generation += 1;
                    self.free.push(index as u16);
                }
            }
        }
        self.live = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Table = HandleTable<kind::Buffer, &'static str>;

    #[test]
    fn released_handles_never_resolve() {
        let mut table = Table::new();
        let a = table.allocate("a").unwrap();
        assert_eq!(*table.resolve(a).unwrap(), "a");

        table.release(a).unwrap();
        assert!(matches!(
            table.resolve(a),
            Err(GpuError::InvalidHandle { kind: "buffer", .. })
        ));

        // The slot is recycled under a new generation
        let b = table.allocate("b").unwrap();
        assert_ne!(a, b);
        assert!(table.resolve(a).is_err());
        assert_eq!(*table.resolve(b).unwrap(), "b");
    }

    #[test]
    fn release_fails_while_referenced() {
        let mut table = Table::new();
        let h = table.allocate("dep").unwrap();
        table.retain(h).unwrap();
        table.retain(h).unwrap();

        assert_eq!(
            table.release(h),
            Err(GpuError::StillReferenced { kind: "buffer", refs: 2 })
        );
        assert!(table.resolve(h).is_ok());

        assert_eq!(table.unretain(h).unwrap(), 1);
        assert_eq!(table.unretain(h).unwrap(), 0);
        assert_eq!(table.release(h).unwrap(), "dep");
        assert!(table.is_empty());
    }

    #[test]
    fn null_handle_is_never_valid() {
        let mut table = Table::new();
        for _ in 0..4 {
            table.allocate("x").unwrap();
        }
        let null = BufferHandle::NULL;
        assert!(null.is_null());
        assert!(table.resolve(null).is_err());
        assert_eq!(BufferHandle::default(), null);
    }

    #[test]
    fn random_sequences_keep_table_consistent() {
        // Small deterministic LCG so the sequence is reproducible
        let mut seed: u32 = 0x2545_f491;
        let mut next = move || {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            seed >> 8
        };

        let mut table: HandleTable<kind::Image, u32> = HandleTable::new();
        let mut live: Vec<(ImageHandle, u32)> = Vec::new();
        let mut dead: Vec<ImageHandle> = Vec::new();

        for step in 0..2_000u32 {
            if live.is_empty() || next() % 3 != 0 {
                let h = table.allocate(step).unwrap();
                live.push((h, step));
            } else {
                let (h, value) = live.swap_remove(next() as usize % live.len());
                assert_eq!(table.release(h).unwrap(), value);
                dead.push(h);
            }
        }

        assert_eq!(table.len(), live.len());
        for (h, value) in &live {
            assert_eq!(table.resolve(*h).unwrap(), value);
        }
        for h in &dead {
            assert!(table.resolve(*h).is_err());
        }
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut table = Table::new();
        let a = table.allocate("a").unwrap();
        table.retain(a).unwrap();
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert!(table.resolve(a).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn debug_names_kind() {
        assert_eq!(format!("{:?}", ShaderHandle::NULL), "shader(null)");
    }
}
