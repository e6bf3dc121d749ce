//! Arena of decoded-frame slots with reference counts and duplicates.
//!
//! An original frame's tag is its slot index. A duplicate aliases the payload
//! of an original and carries a tag with [`DUP_FLAG`] set; releasing it
//! releases one reference on the original. The original goes back to its
//! empty pool only when its count reaches zero.
//!
//! The reference taken when a frame leaves its empty pool belongs to the
//! codec until the codec frees the frame or hands it to the next stage.

use std::sync::Arc;

use ivalink_codec::prelude::*;

/// Tag bit marking a duplicate.
pub(crate) const DUP_FLAG: u32 = 1 << 31;

#[derive(Debug)]
struct Slot {
    frame: Option<Frame>,
    refs: u32,
    /// The codec's reference is among `refs`.
    in_codec: bool,
    invalid: bool,
}

/// Outcome of dropping one reference.
#[derive(Debug)]
pub(crate) enum Release {
    /// Other holders remain.
    Held,
    /// Last reference gone: the frame belongs in its empty pool.
    Empty(Frame),
    /// Last reference gone on a frame of a deleted channel.
    Discarded,
    /// The tag names no live frame or duplicate.
    Unknown,
    /// The codec freed a frame it no longer references.
    NotHeld,
}

#[derive(Debug)]
pub(crate) struct FrameStore {
    slots: Vec<Slot>,
    vacant: Vec<usize>,
    /// Origin of each duplicate slot in use.
    dups: Vec<Option<BufTag>>,
    free_dups: Vec<usize>,
    max_dup: u32,
}

impl FrameStore {
    pub(crate) fn new(dup_slots: usize, max_dup_per_frame: u32) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            dups: vec![None; dup_slots],
            free_dups: (0..dup_slots).rev().collect(),
            max_dup: max_dup_per_frame,
        }
    }

    /// Take ownership of a new output frame and assign its tag.
    pub(crate) fn insert(&mut self, mut frame: Frame) -> Frame {
        let idx = match self.vacant.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    frame: None,
                    refs: 0,
                    in_codec: false,
                    invalid: false,
                });
                self.slots.len() - 1
            }
        };
        frame.tag = BufTag(idx as u32);
        self.slots[idx] = Slot {
            frame: Some(frame.clone()),
            refs: 0,
            in_codec: false,
            invalid: false,
        };
        frame
    }

    fn slot(&self, tag: BufTag) -> Option<&Slot> {
        if tag.0 & DUP_FLAG != 0 {
            return None;
        }
        self.slots.get(tag.0 as usize).filter(|s| s.frame.is_some())
    }

    fn slot_mut(&mut self, tag: BufTag) -> Option<&mut Slot> {
        if tag.0 & DUP_FLAG != 0 {
            return None;
        }
        self.slots.get_mut(tag.0 as usize).filter(|s| s.frame.is_some())
    }

    /// Original behind `tag`, following a duplicate to its origin.
    pub(crate) fn origin(&self, tag: BufTag) -> Option<BufTag> {
        if tag.0 & DUP_FLAG == 0 {
            return self.slot(tag).map(|_| tag);
        }
        *self.dups.get((tag.0 & !DUP_FLAG) as usize)?
    }

    pub(crate) fn refs(&self, tag: BufTag) -> Option<u32> {
        self.slot(self.origin(tag)?).map(|s| s.refs)
    }

    pub(crate) fn dups_in_use(&self) -> usize {
        self.dups.len() - self.free_dups.len()
    }

    /// Mark a frame leaving its empty pool for the codec.
    pub(crate) fn acquire(&mut self, tag: BufTag) {
        if let Some(slot) = self.slot_mut(tag) {
            if slot.refs != 0 {
                tracing::warn!(tag = tag.0, refs = slot.refs, "frame acquired while referenced");
            }
            slot.refs = 1;
            slot.in_codec = true;
        }
    }

    /// The codec freed `tag` while displaying it: its reference passes to
    /// the next stage.
    pub(crate) fn hand_over(&mut self, tag: BufTag) {
        if let Some(slot) = self.slot_mut(tag) {
            slot.in_codec = false;
        }
    }

    /// Drop the codec's reference on `tag`.
    pub(crate) fn release_codec(&mut self, tag: BufTag) -> Release {
        match self.slot_mut(tag) {
            Some(slot) if slot.in_codec => slot.in_codec = false,
            Some(_) => return Release::NotHeld,
            None => return Release::Unknown,
        }
        self.release(tag)
    }

    /// Frames of `ch` the codec still references.
    pub(crate) fn codec_held(&self, ch: ChannelId) -> Vec<BufTag> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_codec && s.frame.as_ref().is_some_and(|f| f.ch == ch))
            .map(|(idx, _)| BufTag(idx as u32))
            .collect()
    }

    /// Record the picture the codec placed in `tag`.
    pub(crate) fn set_display(
        &mut self,
        tag: BufTag,
        info: &DisplayInfo,
        timestamp: u64,
        meta: Option<Arc<[u8]>>,
    ) -> Option<Frame> {
        let frame = self.slot_mut(tag)?.frame.as_mut()?;
        frame.info.width = info.active_width;
        frame.info.height = info.active_height;
        frame.info.start_x = info.start_x;
        frame.info.start_y = info.start_y;
        if info.pitch[0] != 0 {
            frame.info.pitch = info.pitch;
        }
        frame.info.field = info.field;
        frame.timestamp = timestamp;
        frame.meta = meta;
        Some(frame.clone())
    }

    /// Issue a duplicate of `tag` for the next stage while the codec keeps it.
    ///
    /// # Panics
    /// When no duplicate slot is free or the frame already has the maximum
    /// number of duplicates: both pools are sized so this cannot happen.
    pub(crate) fn duplicate(&mut self, tag: BufTag) -> Frame {
        let max_dup = self.max_dup;
        let origin = self.origin(tag);
        let Some((origin, slot)) = origin.and_then(|o| Some((o, self.slot_mut(o)?))) else {
            tracing::error!(tag = tag.0, "duplicate of an unknown frame");
            panic!("duplicate of unknown frame {}", tag.0);
        };
        if slot.refs == 0 || slot.refs > max_dup {
            tracing::error!(tag = origin.0, refs = slot.refs, "duplicate count out of range");
            panic!("frame {} has {} references", origin.0, slot.refs);
        }
        let Some(frame) = slot.frame.clone() else {
            panic!("frame {} vanished", origin.0);
        };
        slot.refs += 1;
        let Some(idx) = self.free_dups.pop() else {
            tracing::error!(tag = origin.0, "duplicate frames exhausted");
            panic!("duplicate frames exhausted");
        };
        self.dups[idx] = Some(origin);
        Frame {
            tag: BufTag(DUP_FLAG | idx as u32),
            ..frame
        }
    }

    /// Drop one reference through `tag`.
    pub(crate) fn release(&mut self, tag: BufTag) -> Release {
        let origin = if tag.0 & DUP_FLAG != 0 {
            let idx = (tag.0 & !DUP_FLAG) as usize;
            let Some(origin) = self.dups.get_mut(idx).and_then(Option::take) else {
                return Release::Unknown;
            };
            self.free_dups.push(idx);
            origin
        } else {
            tag
        };
        let Some(slot) = self.slot_mut(origin) else {
            return Release::Unknown;
        };
        if slot.refs == 0 {
            tracing::error!(tag = origin.0, "frame released more often than referenced");
            return Release::Unknown;
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return Release::Held;
        }
        slot.in_codec = false;
        if slot.invalid {
            slot.frame = None;
            self.vacant.push(origin.0 as usize);
            return Release::Discarded;
        }
        match slot.frame.as_mut() {
            Some(frame) => {
                frame.meta = None;
                frame.info.rt_param_update = false;
                Release::Empty(frame.clone())
            }
            None => Release::Unknown,
        }
    }

    /// Mark every frame of `ch` for discard on its last release.
    pub(crate) fn invalidate_channel(&mut self, ch: ChannelId) {
        for slot in self.slots.iter_mut() {
            if slot.frame.as_ref().is_some_and(|f| f.ch == ch) {
                slot.invalid = true;
            }
        }
    }

    /// Forget an unreferenced frame.
    pub(crate) fn remove(&mut self, tag: BufTag) -> Option<Frame> {
        let slot = self.slot_mut(tag)?;
        if slot.refs != 0 {
            tracing::warn!(tag = tag.0, refs = slot.refs, "removing a referenced frame");
        }
        let frame = slot.frame.take();
        self.vacant.push(tag.0 as usize);
        frame
    }

    /// Live original frames of `ch`.
    pub(crate) fn count(&self, ch: ChannelId) -> usize {
        self.slots
            .iter()
            .filter(|s| s.frame.as_ref().is_some_and(|f| f.ch == ch))
            .count()
    }

    /// Drop every frame, including referenced ones.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.vacant.clear();
        let n = self.dups.len();
        self.dups = vec![None; n];
        self.free_dups = (0..n).rev().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn store_with(n: usize) -> (FrameStore, Vec<BufTag>) {
        let mut store = FrameStore::new(8, 4);
        let tags = (0..n)
            .map(|_| store.insert(Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 16]))).tag)
            .collect();
        (store, tags)
    }

    #[test]
    fn duplicates_alias_the_original() {
        let mut store = FrameStore::new(8, 4);
        let org = store.insert(Frame::new(0, BufTag(0), Payload::from_vec(vec![0; 16])));
        store.acquire(org.tag);
        let dup = store.duplicate(org.tag);
        assert_ne!(dup.tag, org.tag);
        assert!(dup.payload.ptr_eq(&org.payload));
        assert_eq!(store.origin(dup.tag), Some(org.tag));
        assert_eq!(store.refs(org.tag), Some(2));
    }

    #[test]
    fn original_returns_only_after_every_holder() {
        let (mut store, tags) = store_with(1);
        let org = tags[0];
        store.acquire(org);
        let d1 = store.duplicate(org);
        let d2 = store.duplicate(d1.tag);
        assert_eq!(store.refs(org), Some(3));
        assert_eq!(store.dups_in_use(), 2);
        assert!(matches!(store.release(d2.tag), Release::Held));
        assert!(matches!(store.release(org), Release::Held));
        assert!(matches!(store.release(d1.tag), Release::Empty(f) if f.tag == org));
        assert_eq!(store.dups_in_use(), 0);
        assert!(matches!(store.release(org), Release::Unknown));
        assert!(matches!(store.release(d1.tag), Release::Unknown));
    }

    #[test]
    fn invalid_frames_are_discarded_and_slots_reused() {
        let (mut store, tags) = store_with(2);
        store.acquire(tags[1]);
        store.invalidate_channel(0);
        assert!(matches!(store.release(tags[1]), Release::Discarded));
        assert_eq!(store.refs(tags[1]), None);
        assert!(store.remove(tags[0]).is_some());
        assert_eq!(store.count(0), 0);
        let again = store.insert(Frame::new(1, BufTag(0), Payload::empty()));
        assert!(again.tag == tags[0] || again.tag == tags[1]);
    }

    #[test]
    fn codec_reference_is_dropped_once() {
        let (mut store, tags) = store_with(1);
        let org = tags[0];
        store.acquire(org);
        let dup = store.duplicate(org);
        assert_eq!(store.codec_held(0), vec![org]);
        assert!(matches!(store.release_codec(org), Release::Held));
        // A second free from the codec must not take the duplicate's reference.
        assert!(matches!(store.release_codec(org), Release::NotHeld));
        assert_eq!(store.refs(org), Some(1));
        assert!(store.codec_held(0).is_empty());
        assert!(matches!(store.release(dup.tag), Release::Empty(f) if f.tag == org));
    }

    #[test]
    fn handed_over_frames_are_not_codec_held() {
        let (mut store, tags) = store_with(2);
        store.acquire(tags[0]);
        store.acquire(tags[1]);
        store.hand_over(tags[0]);
        assert_eq!(store.codec_held(0), vec![tags[1]]);
        assert!(matches!(store.release_codec(tags[0]), Release::NotHeld));
        store.invalidate_channel(0);
        assert!(matches!(store.release_codec(tags[1]), Release::Discarded));
        assert!(matches!(store.release(tags[0]), Release::Discarded));
        assert_eq!(store.count(0), 0);
    }

    #[test]
    #[should_panic]
    fn duplicate_beyond_the_per_frame_limit_is_fatal() {
        let (mut store, tags) = store_with(1);
        store.acquire(tags[0]);
        for _ in 0..5 {
            store.duplicate(tags[0]);
        }
    }

    #[test]
    fn display_updates_geometry_and_metadata() {
        let (mut store, tags) = store_with(1);
        let info = DisplayInfo {
            active_width: 640,
            active_height: 480,
            pitch: [704, 704],
            ..DisplayInfo::default()
        };
        let meta: Arc<[u8]> = Arc::from(&b"gps"[..]);
        let shown = store.set_display(tags[0], &info, 99, Some(meta)).expect("frame");
        assert_eq!((shown.info.width, shown.info.pitch[0], shown.timestamp), (640, 704, 99));
        store.acquire(tags[0]);
        let Release::Empty(back) = store.release(tags[0]) else {
            panic!("expected the frame back");
        };
        assert!(back.meta.is_none());
    }

    proptest! {
        #[test]
        fn references_are_conserved(ops in proptest::collection::vec((0usize..3, any::<bool>()), 1..60)) {
            let (mut store, tags) = store_with(3);
            let mut holders: Vec<Vec<BufTag>> = vec![Vec::new(); 3];
            let mut returned = 0usize;
            for (i, dup) in ops {
                let org = tags[i];
                if holders[i].is_empty() {
                    store.acquire(org);
                    holders[i].push(org);
                } else if dup && store.dups_in_use() < 8 && holders[i].len() < 5 {
                    let shadow = store.duplicate(org);
                    holders[i].push(shadow.tag);
                } else if let Some(tag) = holders[i].pop() {
                    match store.release(tag) {
                        Release::Empty(f) => {
                            prop_assert!(holders[i].is_empty());
                            prop_assert_eq!(f.tag, org);
                            returned += 1;
                        }
                        Release::Held => prop_assert!(!holders[i].is_empty()),
                        other => prop_assert!(false, "unexpected {:?}", other),
                    }
                }
                prop_assert_eq!(store.refs(org), Some(holders[i].len() as u32));
            }
            let live: usize = holders.iter().map(|h| h.len().saturating_sub(1)).sum();
            prop_assert_eq!(store.dups_in_use(), live);
            prop_assert!(returned <= 60);
        }
    }
}
