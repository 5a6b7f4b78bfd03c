//! Tests for DMA memory and the default packet buffers.

extern crate std;

use alloc::sync::Arc;
use zerocopy::{AsBytes, FromBytes};
use super::*;

#[derive(FromBytes, AsBytes, Debug, PartialEq, Clone, Copy)]
#[repr(C)]
struct Pair {
    a: u32,
    b: u32,
}

#[test]
fn allocations_are_page_sized_and_zeroed() {
    let dma = HeapDmaAllocator::new();
    let buf = dma.allocate_coherent(100).unwrap();
    assert_eq!(buf.size_in_bytes(), PAGE_SIZE);
    assert!(buf.as_slice().iter().all(|&b| b == 0));

    let big = dma.allocate_coherent(PAGE_SIZE + 1).unwrap();
    assert_eq!(big.size_in_bytes(), 2 * PAGE_SIZE);
    assert_ne!(buf.phys_addr(), big.phys_addr());
    assert_eq!(dma.live_allocations(), 2);

    drop(buf);
    drop(big);
    assert_eq!(dma.live_allocations(), 0);
}

#[test]
fn typed_access_is_bounds_checked() {
    let dma = HeapDmaAllocator::new();
    let mut buf = dma.allocate_coherent(PAGE_SIZE).unwrap();
    let p = Pair { a: 1, b: 0xDEAD_BEEF };
    assert_eq!(buf.write_at(8, &p), Some(()));
    assert_eq!(buf.read_at::<Pair>(8), Some(p));
    assert_eq!(buf.write_at(PAGE_SIZE - 4, &p), None);
    assert_eq!(buf.read_at::<Pair>(PAGE_SIZE - 4), None);
    assert_eq!(buf.read_at::<Pair>(usize::MAX), None);
}

#[test]
fn device_side_sees_cpu_side() {
    let dma = HeapDmaAllocator::new();
    let mut buf = dma.allocate_coherent(64).unwrap();
    let phys = buf.phys_addr();

    dma.device_write(phys.offset(16), &[1, 2, 3]).unwrap();
    assert_eq!(&buf.as_slice()[16..19], &[1, 2, 3]);

    buf.as_slice_mut()[100] = 0x5A;
    assert_eq!(dma.device_read(phys.offset(100), 1).unwrap(), [0x5Au8]);

    assert!(dma.device_write(phys.offset(PAGE_SIZE as u64 - 1), &[0, 0]).is_err());
    drop(buf);
    assert!(dma.device_read(phys, 1).is_err());
}

#[test]
fn injected_failures() {
    let dma = HeapDmaAllocator::new();
    dma.fail_after(1);
    assert!(dma.allocate_coherent(8).is_ok());
    assert!(dma.allocate_coherent(8).is_err());
    dma.unlimited();
    assert!(dma.allocate_coherent(8).is_ok());
    assert!(dma.allocate_coherent(0).is_err());
}

#[test]
fn transmit_buffer_is_a_single_fragment() {
    let dma = HeapDmaAllocator::new();
    let mut tx = DmaTransmitBuffer::new(&dma, 60).unwrap();
    tx[0] = 0xFF;
    tx.set_length(42).unwrap();
    assert!(tx.set_length(43).is_err());
    assert_eq!(tx.len(), 42);

    assert_eq!(tx.fragment_count(), 1);
    let frag = tx.map_fragment(0).unwrap();
    assert_eq!(frag, Fragment { phys_addr: tx.phys_addr(), length: 42 });
    assert!(tx.map_fragment(1).is_err());
    assert_eq!(dma.device_read(frag.phys_addr, 1).unwrap(), [0xFFu8]);

    assert!(!tx.timestamp_requested());
    tx.request_timestamp();
    tx.set_checksum_command(0x8000 | 34);
    assert!(tx.timestamp_requested());
    assert_eq!(TransmitPacket::checksum_command(&tx), 0x8022);
    tx.set_timestamp(HwTimestamp { seconds: 7, nanoseconds: 9 });
    assert_eq!(tx.timestamp(), Some(HwTimestamp { seconds: 7, nanoseconds: 9 }));
}

#[test]
fn dropped_receive_buffers_are_recycled() {
    let dma = HeapDmaAllocator::new();
    let provider = DmaReceiveBufferProvider::new(Arc::new(dma.clone()), 4);

    let mut rx = provider.allocate(0).unwrap();
    assert_eq!(rx.capacity(), PAGE_SIZE);
    let phys = rx.map().unwrap();
    dma.device_write(phys, &[9; 4]).unwrap();
    assert_eq!(&rx.as_slice()[..4], &[9; 4]);
    rx.unmap();
    drop(rx);
    assert_eq!(dma.live_allocations(), 1);

    // The same memory comes back, cleared.
    let mut rx = provider.allocate(0).unwrap();
    assert_eq!(rx.map().unwrap(), phys);
    assert!(rx.as_slice().iter().all(|&b| b == 0));
    assert_eq!(dma.live_allocations(), 1);

    // A larger page order cannot reuse the smaller buffer.
    drop(rx);
    let rx = provider.allocate(1).unwrap();
    assert_eq!(rx.capacity(), 2 * PAGE_SIZE);
}

#[test]
fn preallocation_stops_at_pool_capacity() {
    let dma = HeapDmaAllocator::new();
    let provider = DmaReceiveBufferProvider::new(Arc::new(dma.clone()), 2);
    assert_eq!(provider.preallocate(5, 0), Ok(2));
    // The third buffer could not be pooled and was released.
    assert_eq!(dma.live_allocations(), 2);

    let _a = provider.allocate(0).unwrap();
    let _b = provider.allocate(0).unwrap();
    assert_eq!(dma.live_allocations(), 2);
    let _c = provider.allocate(0).unwrap();
    assert_eq!(dma.live_allocations(), 3);
}

#[test]
fn received_packet_exposes_only_its_length() {
    let dma = HeapDmaAllocator::new();
    let provider = DmaReceiveBufferProvider::new(Arc::new(dma.clone()), 1);
    let mut buffer = provider.allocate(0).unwrap();
    let phys = buffer.map().unwrap();
    dma.device_write(phys, b"hello world").unwrap();
    let packet = ReceivedPacket { buffer, length: 5, queue: 3, timestamp: None, checksum: None };
    assert_eq!(packet.data(), b"hello");
}

fn assert_shareable<T: Send + Sync + ?Sized>() {}
fn assert_sendable<T: Send + ?Sized>() {}

#[test]
fn buffers_can_cross_threads() {
    assert_shareable::<DmaBuffer>();
    assert_shareable::<DmaReceiveBufferProvider>();
    assert_shareable::<dyn ReceiveBufferProvider>();
    assert_sendable::<DmaReceiveBuffer>();
    assert_sendable::<DmaTransmitBuffer>();

    // A receive buffer allocated on one thread is released into the pool on another.
    let dma: Arc<dyn DmaAllocator> = Arc::new(HeapDmaAllocator::new());
    let provider = Arc::new(DmaReceiveBufferProvider::new(dma, 4));
    let buffer = provider.allocate(0).unwrap();
    std::thread::spawn(move || drop(buffer)).join().unwrap();
    let again = provider.allocate(0).unwrap();
    assert_eq!(again.capacity(), PAGE_SIZE);
}
