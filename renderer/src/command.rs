// gallium/renderer/src/command.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Command buffers: reservation, packets, relocations, and serialization for submission.

use byteorder::{ByteOrder, LittleEndian};
use fxhash::FxHashSet;
use gallium_gpu::resource::{Buffer, ResourceId, SamplerView, Surface, Texture};
use gallium_gpu::{PipeError, PipeResult, Winsys, WinsysLimits};
use std::ops::Range;
use std::sync::Arc;

/// How packet headers are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketFormat {
    /// One header dword: `3 << 30 | (count - 1) << 16 | opcode << 8`.
    Pkt3,
    /// Two header dwords: the command id, then the payload size in bytes.
    Svga,
}

impl PacketFormat {
    #[inline]
    pub fn header_dwords(self) -> usize {
        match self {
            PacketFormat::Pkt3 => 1,
            PacketFormat::Svga => 2,
        }
    }

    #[inline]
    pub fn packet_dwords(self, payload_dwords: usize) -> usize {
        self.header_dwords() + payload_dwords
    }

    pub fn write_header(self, out: &mut [u32], opcode: u32, payload_dwords: usize) {
        match self {
            PacketFormat::Pkt3 => {
                let count = (payload_dwords as u32).saturating_sub(1) & 0x3fff;
                out[0] = 3 << 30 | count << 16 | (opcode & 0xff) << 8;
            }
            PacketFormat::Svga => {
                out[0] = opcode;
                out[1] = (payload_dwords * 4) as u32;
            }
        }
    }

    /// Splits a header back into `(opcode, payload dwords)`.
    pub fn read_header(self, words: &[u32]) -> Option<(u32, usize)> {
        match self {
            PacketFormat::Pkt3 => {
                let header = *words.get(0)?;
                if header >> 30 != 3 {
                    return None;
                }
                Some(((header >> 8) & 0xff, ((header >> 16) & 0x3fff) as usize + 1))
            }
            PacketFormat::Svga => {
                let (opcode, bytes) = (*words.get(0)?, *words.get(1)?);
                Some((opcode, bytes as usize / 4))
            }
        }
    }
}

/// A resource mentioned by a command. Held until the command buffer is submitted.
pub enum Relocation<W> where W: Winsys {
    Buffer(Arc<Buffer<W>>),
    Texture(Arc<Texture<W>>),
    Surface(Arc<Surface<W>>),
    SamplerView(Arc<SamplerView<W>>),
}

impl<W> Relocation<W> where W: Winsys {
    fn id(&self) -> ResourceId {
        match *self {
            Relocation::Buffer(ref buffer) => buffer.id(),
            Relocation::Texture(ref texture) => texture.id(),
            Relocation::Surface(ref surface) => surface.id(),
            Relocation::SamplerView(ref view) => view.id(),
        }
    }

    /// Bytes accounted to the `(gtt, vram)` budgets.
    fn footprint(&self) -> (u64, u64) {
        match *self {
            Relocation::Buffer(ref buffer) => (buffer.size() as u64, 0),
            Relocation::Texture(ref texture) => (0, texture.desc().cache_key().byte_size()),
            Relocation::Surface(ref surface) => {
                let key = match surface.view() {
                    Some(view) => view.key,
                    None => surface.texture().desc().cache_key(),
                };
                (0, key.byte_size())
            }
            Relocation::SamplerView(ref view) => {
                let desc = view.texture().desc();
                (0, desc.sampler_view_key(view.first_level(), view.last_level()).byte_size())
            }
        }
    }
}

pub struct CommandBuffer<W> where W: Winsys {
    format: PacketFormat,
    dwords: Vec<u32>,
    capacity: usize,
    reservation: Option<Range<usize>>,
    relocations: Vec<Relocation<W>>,
    referenced: FxHashSet<ResourceId>,
    gtt_used: u64,
    vram_used: u64,
    gtt_limit: u64,
    vram_limit: u64,
    packets: u32,
}

impl<W> CommandBuffer<W> where W: Winsys {
    /// Allocates the whole buffer up front; failure here is fatal to the context.
    pub fn new(format: PacketFormat, limits: &WinsysLimits) -> PipeResult<CommandBuffer<W>> {
        let mut dwords: Vec<u32> = vec![];
        if dwords.try_reserve_exact(limits.max_cmd_dwords).is_err() {
            return Err(PipeError::Fatal("cannot allocate the command buffer"));
        }
        Ok(CommandBuffer {
            format,
            dwords,
            capacity: limits.max_cmd_dwords,
            reservation: None,
            relocations: vec![],
            referenced: FxHashSet::default(),
            gtt_used: 0,
            vram_used: 0,
            gtt_limit: limits.gtt_bytes,
            vram_limit: limits.vram_bytes,
            packets: 0,
        })
    }

    #[inline]
    pub fn format(&self) -> PacketFormat {
        self.format
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.dwords.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.dwords.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    #[inline]
    pub fn packet_count(&self) -> u32 {
        self.packets
    }

    #[inline]
    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    #[inline]
    pub fn budget_used(&self) -> (u64, u64) {
        (self.gtt_used, self.vram_used)
    }

    /// Claims `count` contiguous dwords to be filled in place and then `commit()`ed.
    pub fn reserve(&mut self, count: usize) -> PipeResult<&mut [u32]> {
        if self.reservation.is_some() {
            return Err(PipeError::Fatal("command reservation already in flight"));
        }
        let start = self.dwords.len();
        if count > self.capacity - start {
            return Err(PipeError::OutOfMemory);
        }
        self.dwords.resize(start + count, 0);
        self.reservation = Some(start..(start + count));
        Ok(&mut self.dwords[start..])
    }

    /// Finalizes the outstanding reservation.
    pub fn commit(&mut self) {
        match self.reservation.take() {
            Some(_) => self.packets += 1,
            None => warn!("command buffer commit without a reservation"),
        }
    }

    /// Reserves a packet and writes its header. Returns the dword offset of the payload and the
    /// payload itself. The caller commits.
    pub fn reserve_packet(&mut self, opcode: u32, payload_dwords: usize)
                          -> PipeResult<(usize, &mut [u32])> {
        let format = self.format;
        let header_dwords = format.header_dwords();
        let start = self.dwords.len();
        let words = self.reserve(format.packet_dwords(payload_dwords))?;
        format.write_header(words, opcode, payload_dwords);
        Ok((start + header_dwords, &mut words[header_dwords..]))
    }

    /// Writes a whole packet. Returns the dword offset of its payload.
    pub fn packet(&mut self, opcode: u32, payload: &[u32]) -> PipeResult<usize> {
        let (offset, words) = self.reserve_packet(opcode, payload.len())?;
        words.copy_from_slice(payload);
        self.commit();
        Ok(offset)
    }

    /// Overwrites already committed dwords.
    pub fn patch(&mut self, offset: usize, words: &[u32]) {
        self.dwords[offset..(offset + words.len())].copy_from_slice(words);
    }

    #[inline]
    pub fn references(&self, id: ResourceId) -> bool {
        self.referenced.contains(&id)
    }

    /// Keeps `relocation` alive until submission and charges it against the memory budgets.
    pub fn add_relocation(&mut self, relocation: Relocation<W>) -> PipeResult<()> {
        let id = relocation.id();
        if self.referenced.contains(&id) {
            return Ok(());
        }
        let (gtt, vram) = relocation.footprint();
        if self.gtt_used + gtt > self.gtt_limit || self.vram_used + vram > self.vram_limit {
            debug!("relocation of {:?} exceeds the budget ({}+{} gtt, {}+{} vram)",
                   id,
                   self.gtt_used,
                   gtt,
                   self.vram_used,
                   vram);
            return Err(PipeError::OutOfMemory);
        }
        self.gtt_used += gtt;
        self.vram_used += vram;
        self.referenced.insert(id);
        self.relocations.push(relocation);
        Ok(())
    }

    /// The little-endian bytes handed to the winsys.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(self.reservation.is_none());
        let mut bytes = vec![0; self.dwords.len() * 4];
        LittleEndian::write_u32_into(&self.dwords, &mut bytes);
        bytes
    }

    /// Starts over with an empty buffer, dropping every relocation.
    pub fn reset(&mut self) {
        self.dwords.clear();
        self.reservation = None;
        self.relocations.clear();
        self.referenced.clear();
        self.gtt_used = 0;
        self.vram_used = 0;
        self.packets = 0;
    }
}

/// Walks the packets of a serialized stream as `(opcode, payload)` pairs.
pub struct PacketIter<'a> {
    format: PacketFormat,
    words: &'a [u32],
}

impl<'a> PacketIter<'a> {
    #[inline]
    pub fn new(format: PacketFormat, words: &'a [u32]) -> PacketIter<'a> {
        PacketIter { format, words }
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = (u32, &'a [u32]);

    fn next(&mut self) -> Option<(u32, &'a [u32])> {
        let (opcode, payload_dwords) = self.format.read_header(self.words)?;
        let start = self.format.header_dwords();
        let end = start + payload_dwords;
        if end > self.words.len() {
            return None;
        }
        let payload = &self.words[start..end];
        self.words = &self.words[end..];
        Some((opcode, payload))
    }
}

#[cfg(test)]
mod test {
    use super::{CommandBuffer, PacketFormat, PacketIter, Relocation};
    use byteorder::{ByteOrder, LittleEndian};
    use gallium_gpu::options::DebugOptions;
    use gallium_gpu::screen::Screen;
    use gallium_nullws::NullWinsys;
    use gallium_gpu::{BindFlags, PipeError, WinsysLimits};

    fn limits(max_cmd_dwords: usize) -> WinsysLimits {
        WinsysLimits { max_cmd_dwords, ..WinsysLimits::default() }
    }

    #[test]
    fn test_pkt3_header_layout() {
        let mut words = [0; 1];
        PacketFormat::Pkt3.write_header(&mut words, 0x69, 3);
        assert_eq!(words[0], 3 << 30 | 2 << 16 | 0x69 << 8);
        assert_eq!(PacketFormat::Pkt3.read_header(&words), Some((0x69, 3)));
    }

    #[test]
    fn test_reserve_fails_past_capacity() {
        let mut cs: CommandBuffer<NullWinsys> =
            CommandBuffer::new(PacketFormat::Pkt3, &limits(100)).unwrap();
        cs.reserve(96).unwrap();
        cs.commit();
        assert_eq!(cs.remaining(), 4);
        assert_eq!(cs.reserve(10).err(), Some(PipeError::OutOfMemory));
        cs.reset();
        assert_eq!(cs.used(), 0);
        assert!(cs.reserve(10).is_ok());
    }

    #[test]
    fn test_nested_reservation_is_an_error() {
        let mut cs: CommandBuffer<NullWinsys> =
            CommandBuffer::new(PacketFormat::Pkt3, &limits(100)).unwrap();
        cs.reserve(4).unwrap();
        assert!(match cs.reserve(4) {
            Err(PipeError::Fatal(_)) => true,
            _ => false,
        });
        cs.commit();
        assert_eq!(cs.used(), 4);
        assert!(cs.reserve(4).is_ok());
    }

    #[test]
    fn test_packets_round_trip_through_the_iterator() {
        let mut cs: CommandBuffer<NullWinsys> =
            CommandBuffer::new(PacketFormat::Svga, &limits(64)).unwrap();
        cs.packet(1040, &[1, 2]).unwrap();
        let offset = cs.packet(1041, &[0; 3]).unwrap();
        cs.patch(offset + 1, &[7]);
        let packets: Vec<_> = PacketIter::new(PacketFormat::Svga, cs.dwords()).collect();
        assert_eq!(packets, vec![(1040, &[1, 2][..]), (1041, &[0, 7, 0][..])]);
        assert_eq!(cs.packet_count(), 2);
        let bytes = cs.serialize();
        let expected = PacketFormat::Svga.packet_dwords(2) + PacketFormat::Svga.packet_dwords(3);
        assert_eq!(bytes.len(), expected * 4);
        let mut words = vec![0; expected];
        LittleEndian::read_u32_into(&bytes, &mut words);
        assert_eq!(words, vec![1040, 8, 1, 2, 1041, 12, 0, 7, 0]);
    }

    #[test]
    fn test_relocations_are_deduplicated_and_budgeted() {
        let screen = Screen::new_hardware(NullWinsys::new(), DebugOptions::default());
        let buffer = screen.create_buffer(4096, BindFlags::VERTEX_BUFFER).unwrap();
        let limits = WinsysLimits { gtt_bytes: 6000, ..limits(64) };
        let mut cs: CommandBuffer<NullWinsys> =
            CommandBuffer::new(PacketFormat::Pkt3, &limits).unwrap();
        cs.add_relocation(Relocation::Buffer(buffer.clone())).unwrap();
        cs.add_relocation(Relocation::Buffer(buffer.clone())).unwrap();
        assert_eq!(cs.budget_used(), (4096, 0));

        let other = screen.create_buffer(4096, BindFlags::VERTEX_BUFFER).unwrap();
        assert_eq!(cs.add_relocation(Relocation::Buffer(other)).err(),
                   Some(PipeError::OutOfMemory));
        cs.reset();
        assert!(!cs.references(buffer.id()));
    }
}
