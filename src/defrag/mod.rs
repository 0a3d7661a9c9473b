//! MStream defragmentation.
//!
//! Devices split an MStream frame larger than the UDP payload budget into
//! pieces sharing one `fragment_id`, each tagged with its byte offset and
//! the LAST flag on the final piece. The transport is at-least-once and
//! unordered, so pieces arrive duplicated and out of order.
//!
//! One [`Defragmenter`] serves one device. Assembly per fragment id
//! follows the classic IPv4 reassembly scheme: an offset-sorted piece
//! list, the highest byte-end seen, a running payload total and a LAST
//! latch; the fragment is complete when the LAST piece has been seen and
//! the total equals the highest end. Completed fragments are released in
//! ascending fragment-id order through a closed-id watermark, so a
//! downstream event builder never observes id N+1 before id N.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::error::DefragError;
use crate::protocol::{EventFragment, MStreamFragment};
use crate::types::{DeviceFamily, DeviceName};

/// Cap on buffered pieces per fragment id before the whole list is
/// dropped.
pub const MAX_FRAGMENTS_PER_ASSEMBLY: usize = 100;

/// Piece list and counters for one in-flight fragment id.
#[derive(Debug, Default)]
struct Assembly {
    /// Pieces sorted by `fragment_offset`.
    pieces: Vec<MStreamFragment>,
    /// Highest byte end seen: max(offset + length).
    highest: u32,
    /// Sum of piece lengths.
    total: u32,
    last_received: bool,
    device_id: u8,
    subtype: u8,
}

enum Insert {
    /// Piece stored (or dropped as a duplicate); fragment still open.
    Pending,
    /// All pieces present; the concatenated payload.
    Complete(Vec<u8>),
}

impl Assembly {
    fn insert(&mut self, piece: MStreamFragment, id: u16) -> Result<Insert, DefragError> {
        if self.pieces.is_empty() {
            self.device_id = piece.device_id;
            self.subtype = piece.subtype;
        }

        match self
            .pieces
            .binary_search_by_key(&piece.fragment_offset, |p| p.fragment_offset)
        {
            // Same offset seen before: at-least-once transport, drop the
            // duplicate and keep the assembly state untouched.
            Ok(_) => {
                debug!(
                    fragment_id = id,
                    offset = piece.fragment_offset,
                    "duplicate fragment piece dropped"
                );
                return Ok(Insert::Pending);
            }
            Err(at) => {
                if piece.is_last() {
                    self.last_received = true;
                }
                self.highest = self.highest.max(piece.end_offset());
                self.total += u32::from(piece.fragment_length);
                self.pieces.insert(at, piece);
            }
        }

        if self.pieces.len() > MAX_FRAGMENTS_PER_ASSEMBLY {
            return Err(DefragError::TooManyFragments {
                fragment_id: id,
                max: MAX_FRAGMENTS_PER_ASSEMBLY,
            });
        }

        if self.last_received && self.highest == self.total {
            return self.assemble(id).map(Insert::Complete);
        }
        Ok(Insert::Pending)
    }

    /// Concatenate the sorted pieces, asserting that each begins exactly
    /// where the previous ended (first at offset 0).
    fn assemble(&mut self, id: u16) -> Result<Vec<u8>, DefragError> {
        let mut data = Vec::with_capacity(self.highest as usize);
        let mut expected = 0u32;
        for piece in &self.pieces {
            if u32::from(piece.fragment_offset) != expected {
                return Err(DefragError::AssemblyHole {
                    fragment_id: id,
                    offset: piece.fragment_offset,
                });
            }
            data.extend_from_slice(&piece.data);
            expected += u32::from(piece.fragment_length);
        }
        Ok(data)
    }
}

/// Per-device defragmenter.
pub struct Defragmenter {
    device: DeviceName,
    family: DeviceFamily,
    open: HashMap<u16, Assembly>,
    /// Completed fragments waiting for their predecessor id to close.
    ready: BTreeMap<u16, EventFragment>,
    /// Ids closed without emission (hole or capacity drop); lets the
    /// watermark pass them.
    skipped: HashSet<u16>,
    /// Next fragment id allowed to leave, once initialized by the first
    /// completion.
    next_emit: Option<u16>,
    out: VecDeque<EventFragment>,
}

impl Defragmenter {
    pub fn new(device: DeviceName, family: DeviceFamily) -> Self {
        Self {
            device,
            family,
            open: HashMap::new(),
            ready: BTreeMap::new(),
            skipped: HashSet::new(),
            next_emit: None,
            out: VecDeque::new(),
        }
    }

    /// Insert one fragment piece.
    ///
    /// Errors drop the piece list for the offending fragment id and mark
    /// the id closed; the caller logs and keeps feeding. Fragments that
    /// became emittable, whether by this completion or because the error
    /// unblocked the watermark, are collected via [`Self::drain`].
    pub fn insert(&mut self, piece: MStreamFragment) -> Result<(), DefragError> {
        let id = piece.fragment_id;
        let result = self.open.entry(id).or_default().insert(piece, id);

        match result {
            Ok(Insert::Pending) => Ok(()),
            Ok(Insert::Complete(data)) => {
                let assembly = self.open.remove(&id).expect("assembly exists");
                match EventFragment::from_assembled(
                    self.family,
                    assembly.device_id,
                    assembly.subtype,
                    id,
                    &data,
                ) {
                    Ok(fragment) => self.complete(id, fragment),
                    Err(err) => {
                        // Payload smaller than its own header or with a
                        // subtype the family does not define: the
                        // assembled bytes are unusable.
                        warn!(
                            device = %self.device,
                            fragment_id = id,
                            %err,
                            "dropping undecodable assembled fragment"
                        );
                        self.close_without_emit(id);
                    }
                }
                self.pump();
                Ok(())
            }
            Err(err) => {
                self.open.remove(&id);
                self.close_without_emit(id);
                self.pump();
                Err(err)
            }
        }
    }

    /// Take every fragment the watermark has released, in id order.
    pub fn drain(&mut self) -> Vec<EventFragment> {
        self.out.drain(..).collect()
    }

    /// Number of fragment ids currently mid-assembly.
    pub fn open_assemblies(&self) -> usize {
        self.open.len()
    }

    fn complete(&mut self, id: u16, fragment: EventFragment) {
        if let Some(next) = self.next_emit {
            // Wrap-aware: ids more than half the u16 space ahead are
            // treated as behind.
            if (id.wrapping_sub(next) as i16) < 0 {
                warn!(
                    device = %self.device,
                    fragment_id = id,
                    watermark = next,
                    "discarding fragment assembled behind the emission watermark"
                );
                return;
            }
        }
        self.ready.insert(id, fragment);
    }

    fn close_without_emit(&mut self, id: u16) {
        if let Some(next) = self.next_emit {
            if (id.wrapping_sub(next) as i16) < 0 {
                return;
            }
        }
        self.skipped.insert(id);
    }

    /// Move released fragments to the output queue: the first completion
    /// seeds the watermark, after which ids leave strictly one after
    /// another, stepping over ids that closed without a fragment.
    fn pump(&mut self) {
        loop {
            let next = match self.next_emit {
                Some(next) => next,
                None => match self.ready.keys().next().copied() {
                    Some(first) => first,
                    None => return,
                },
            };

            if let Some(fragment) = self.ready.remove(&next) {
                self.out.push_back(fragment);
                self.next_emit = Some(next.wrapping_add(1));
            } else if self.skipped.remove(&next) {
                self.next_emit = Some(next.wrapping_add(1));
            } else {
                return;
            }
        }
    }
}
