//! Performance benchmarks for the hot paths of the relay protocol

use client::Client;
use relay::{Relay, RelayConfig};
use shared::{checksum, Event, EventType, FrameAssembler, SocketRegistry, MAX_PAYLOAD_SIZE};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Benchmarks the payload checksum over maximum-size payloads
#[test]
fn benchmark_checksum() {
    let payload: Vec<u8> = (0..MAX_PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();

    let iterations = 100_000;
    let start = Instant::now();

    let mut acc = 0u32;
    for _ in 0..iterations {
        acc ^= checksum(&payload);
    }

    let duration = start.elapsed();
    println!(
        "Checksum: {} iterations in {:?} ({:.2} ns/iter, acc {:08x})",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64,
        acc
    );

    // 100k full payloads should take well under two seconds even unoptimised
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks sealing an event and verifying it on the way back in
#[test]
fn benchmark_seal_and_verify() {
    let payload = [0xA5u8; 512];

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut event = Event::with_payload(EventType::PlayerReady, &payload).unwrap();
        let frame = event.seal_frame().unwrap();
        let decoded = Event::from_frame(&frame).unwrap();
        assert_eq!(decoded.size(), payload.len());
    }

    let duration = start.elapsed();
    println!(
        "Seal + verify: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks re-assembly of a stream delivered in awkward fragments
#[test]
fn benchmark_frame_reassembly() {
    let mut stream = Vec::new();
    let frames = 10_000;
    for i in 0..frames {
        let mut event = Event::encode_payload(EventType::PlayerReady, &(i as u32)).unwrap();
        stream.extend_from_slice(&event.seal_frame().unwrap());
    }

    let start = Instant::now();
    let mut assembler = FrameAssembler::new();
    let mut recovered = 0;
    for chunk in stream.chunks(7) {
        assembler.push(chunk);
        while let Some(_frame) = assembler.next_frame().unwrap() {
            recovered += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Reassembly: {} frames in {:?} ({:.2} μs/frame)",
        recovered,
        duration,
        duration.as_micros() as f64 / recovered as f64
    );

    assert_eq!(recovered, frames);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks end-to-end fan-out from one client to several others
#[test]
fn benchmark_fan_out() {
    let registry = Arc::new(SocketRegistry::new());
    let mut relay = Relay::with_registry(
        Arc::clone(&registry),
        RelayConfig {
            tick_rate: 1,
            ..RelayConfig::default()
        },
    );
    assert!(relay.activate(0));
    let port = relay.port().unwrap();

    let mut clients: Vec<Client> = Vec::new();
    for _ in 0..5 {
        let mut client = Client::with_registry(Arc::clone(&registry));
        assert!(client.connect(Ipv4Addr::LOCALHOST, port));
        clients.push(client);
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    while relay.client_count() < clients.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(relay.client_count(), clients.len());

    let events = 200;
    let start = Instant::now();

    let (sender, receivers) = clients.split_at_mut(1);
    for i in 0..events {
        let mut event = Event::encode_payload(EventType::PlayerReady, &(i as u32)).unwrap();
        assert!(sender[0].send(&mut event));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = vec![0; receivers.len()];
    while received.iter().any(|count| *count < events) && Instant::now() < deadline {
        for (client, count) in receivers.iter_mut().zip(received.iter_mut()) {
            while let Some(event) = client.recv() {
                if event.event_type() == Some(EventType::PlayerReady) {
                    *count += 1;
                }
            }
        }
        thread::sleep(Duration::from_micros(200));
    }

    let duration = start.elapsed();
    println!(
        "Fan-out: {} events to {} clients in {:?}",
        events,
        receivers.len(),
        duration
    );

    assert!(received.iter().all(|count| *count == events));
    assert!(duration.as_millis() < 5000);
    relay.deactivate();
}
