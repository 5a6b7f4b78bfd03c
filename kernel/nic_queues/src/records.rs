//! The fixed-size records exchanged with the device through queue memory.
//! All fields are little-endian.

use zerocopy::{AsBytes, FromBytes, Unaligned};
use zerocopy::byteorder::{LittleEndian, U16, U32, U64};
use nic_buffers::{Fragment, PhysicalAddress};
use crate::regs::{CPL_SIZE, DESC_SIZE, EVENT_SIZE};


/// Describes one fragment of a packet (TX) or one empty buffer (RX).
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct Descriptor {
    _reserved:  U16<LittleEndian>,
    csum_cmd:   U16<LittleEndian>,
    len:        U32<LittleEndian>,
    addr:       U64<LittleEndian>,
}

const_assert_eq!(core::mem::size_of::<Descriptor>(), DESC_SIZE);

impl Descriptor {
    pub fn new(addr: PhysicalAddress, len: u32, csum_cmd: u16) -> Descriptor {
        Descriptor {
            _reserved: U16::new(0),
            csum_cmd: U16::new(csum_cmd),
            len: U32::new(len),
            addr: U64::new(addr.value()),
        }
    }

    pub fn from_fragment(fragment: &Fragment, csum_cmd: u16) -> Descriptor {
        Descriptor::new(fragment.phys_addr, fragment.length, csum_cmd)
    }

    pub fn csum_cmd(&self) -> u16 { self.csum_cmd.get() }
    pub fn len(&self) -> u32 { self.len.get() }
    pub fn addr(&self) -> PhysicalAddress { PhysicalAddress::new(self.addr.get()) }
}


/// Written by the device when it has finished with one ring slot.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct CompletionRecord {
    queue:          U16<LittleEndian>,
    index:          U16<LittleEndian>,
    len:            U16<LittleEndian>,
    _reserved1:     [u8; 2],
    ts_ns:          U32<LittleEndian>,
    ts_s:           U16<LittleEndian>,
    rx_csum:        U16<LittleEndian>,
    rx_hash:        U32<LittleEndian>,
    rx_hash_type:   u8,
    _reserved2:     [u8; 11],
}

const_assert_eq!(core::mem::size_of::<CompletionRecord>(), CPL_SIZE);

impl CompletionRecord {
    /// A completion of slot `index` of ring `queue`, `len` bytes long.
    pub fn new(queue: u16, index: u16, len: u16) -> CompletionRecord {
        CompletionRecord {
            queue: U16::new(queue),
            index: U16::new(index),
            len: U16::new(len),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, ts_s: u16, ts_ns: u32) -> CompletionRecord {
        self.ts_s = U16::new(ts_s);
        self.ts_ns = U32::new(ts_ns);
        self
    }

    pub fn with_rx_checksum(mut self, csum: u16) -> CompletionRecord {
        self.rx_csum = U16::new(csum);
        self
    }

    pub fn with_rx_hash(mut self, hash: u32, hash_type: u8) -> CompletionRecord {
        self.rx_hash = U32::new(hash);
        self.rx_hash_type = hash_type;
        self
    }

    /// The index of the ring this completion belongs to.
    pub fn queue(&self) -> u16 { self.queue.get() }
    /// The hardware pointer of the completed slot, not yet masked to the ring size.
    pub fn index(&self) -> u16 { self.index.get() }
    pub fn len(&self) -> u16 { self.len.get() }
    pub fn ts_ns(&self) -> u32 { self.ts_ns.get() }
    /// The low bits of the timestamp's seconds.
    pub fn ts_s(&self) -> u16 { self.ts_s.get() }
    pub fn rx_csum(&self) -> u16 { self.rx_csum.get() }
    pub fn rx_hash(&self) -> u32 { self.rx_hash.get() }
    pub fn rx_hash_type(&self) -> u8 { self.rx_hash_type }
}


/// Written by the device to an event queue to say that a completion queue has new records.
#[derive(FromBytes, AsBytes, Unaligned, Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct EventRecord {
    kind:       U16<LittleEndian>,
    source:     U16<LittleEndian>,
    _reserved:  [u8; 28],
}

const_assert_eq!(core::mem::size_of::<EventRecord>(), EVENT_SIZE);

impl EventRecord {
    pub fn new(kind: u16, source: u16) -> EventRecord {
        EventRecord { kind: U16::new(kind), source: U16::new(source), _reserved: [0; 28] }
    }

    /// One of the `EVENT_TYPE_*` constants.
    pub fn kind(&self) -> u16 { self.kind.get() }
    /// The index of the completion queue that has new records.
    pub fn source(&self) -> u16 { self.source.get() }
}
