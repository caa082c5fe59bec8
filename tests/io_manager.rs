//! End-to-end scenarios that need real sockets and real OS threads: a
//! non-blocking connect waking a parked continuation, and cancellation
//! firing its continuation exactly once.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corosched::{Event, IoManager};

fn nonblocking_connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    stream
}

#[test]
fn connect_fires_write_continuation_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = listener.accept();
    });

    let io = IoManager::new(1, false, "test-io-connect").unwrap();
    let stream = nonblocking_connect(addr);
    let fd = stream.as_raw_fd();

    let (tx, rx) = std::sync::mpsc::channel();
    io.add_event(fd, Event::Write, Some(Box::new(move || {
        let _ = tx.send(());
    })))
    .unwrap();

    rx.recv_timeout(Duration::from_secs(2)).expect("write readiness never fired");
    assert!(!io.del_event(fd, Event::Write));
    io.stop();
    assert_eq!(io.pending_events(), 0);
}

#[test]
fn cancel_event_fires_continuation_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(5));
        drop(sock);
    });

    let io = IoManager::new(1, false, "test-io-cancel").unwrap();
    let stream = nonblocking_connect(addr);
    let fd = stream.as_raw_fd();

    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count2 = fire_count.clone();
    io.add_event(
        fd,
        Event::Read,
        Some(Box::new(move || {
            fire_count2.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert!(io.cancel_event(fd, Event::Read));
    assert!(!io.cancel_event(fd, Event::Read), "cancelling twice must not fire twice");
    std::thread::sleep(Duration::from_millis(150));
    io.stop();

    assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    assert_eq!(io.pending_events(), 0);
}

#[test]
fn cancel_all_fires_both_armed_continuations() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_secs(5));
        drop(sock);
    });

    let io = IoManager::new(1, false, "test-io-cancel-all").unwrap();
    let stream = nonblocking_connect(addr);
    let fd = stream.as_raw_fd();

    let fired = Arc::new(AtomicUsize::new(0));
    let (f1, f2) = (fired.clone(), fired.clone());
    io.add_event(fd, Event::Read, Some(Box::new(move || { f1.fetch_add(1, Ordering::SeqCst); }))).unwrap();
    io.add_event(fd, Event::Write, Some(Box::new(move || { f2.fetch_add(1, Ordering::SeqCst); }))).unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert!(io.cancel_all(fd));
    std::thread::sleep(Duration::from_millis(150));
    io.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(io.pending_events(), 0);
}

#[test]
fn add_event_rejects_double_arming() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let _ = listener.accept();
    });

    let io = IoManager::new(1, false, "test-io-double-arm").unwrap();
    let stream = nonblocking_connect(addr);
    let fd = stream.as_raw_fd();

    io.add_event(fd, Event::Write, Some(Box::new(|| {}))).unwrap();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        io.add_event(fd, Event::Write, Some(Box::new(|| {})))
    }));
    assert!(result.is_err(), "arming an already-armed event must panic");

    io.stop();
}

#[test]
fn unregistered_fd_cancel_is_a_harmless_false() {
    let io = IoManager::new(1, false, "test-io-unregistered").unwrap();
    let dummy_fd = 9999;
    assert!(!io.cancel_event(dummy_fd, Event::Read));
    assert!(!io.cancel_all(dummy_fd));
    let _: io::Result<()> = Ok(());
    io.stop();
}
