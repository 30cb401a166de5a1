extern crate kxio;

use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kxio::{CompletionQueue, Handle, Session, Status};

#[test]
fn concurrency_bound_holds_with_one_extra_waiter() {
    let _ = env_logger::builder().is_test(true).try_init();

    const LIMIT: usize = 2;
    const PACKETS: u64 = 60;

    let queue = CompletionQueue::new(LIMIT);
    let processing = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(AtomicUsize::new(0));

    let workers = (0..=LIMIT)
        .map(|_| {
            let mut waiter = queue.register_waiter().unwrap();
            let (processing, peak, received) =
                (Arc::clone(&processing), Arc::clone(&peak), Arc::clone(&received));
            thread::spawn(move || {
                while let Ok(_packet) = waiter.wait(None) {
                    let now = processing.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    processing.fetch_sub(1, Ordering::SeqCst);
                    received.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect::<Vec<_>>();

    for token in 0..PACKETS {
        queue.post_completion(0, 0, token).unwrap();
    }
    while received.load(Ordering::SeqCst) < PACKETS as usize {
        assert!(queue.active_waiters() <= LIMIT);
        thread::sleep(Duration::from_millis(1));
    }
    queue.close().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= LIMIT);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(queue.registered_waiters(), 0);
}

#[test]
fn close_abandons_every_waiter_exactly_once() {
    let queue = CompletionQueue::new(0);
    let workers = (0..5)
        .map(|_| {
            let mut waiter = queue.register_waiter().unwrap();
            thread::spawn(move || {
                let first = waiter.wait(None).map(|_| ());
                let second = waiter.wait(Some(Duration::from_millis(10))).map(|_| ());
                (first, second)
            })
        })
        .collect::<Vec<_>>();

    while queue.blocked_waiters() < 5 {
        thread::yield_now();
    }
    queue.close().unwrap();

    for worker in workers {
        let (first, second) = worker.join().unwrap();
        assert_eq!(first.unwrap_err().status(), Status::Abandoned);
        // the closed queue is now an invalid handle, not another abandonment.
        assert_eq!(second.unwrap_err().status(), Status::InvalidHandle);
    }
}

#[test]
fn posted_tuple_round_trips_including_token_zero() -> Result<(), Box<dyn Error + 'static>> {
    let session = Session::builder().with_worker_threads(1).open()?;
    let queue = session.create_completion_queue(None, None, 0, 1)?;

    session.post_completion(queue, 0, 0, 0)?;
    session.post_completion(queue, usize::MAX, u64::MAX, u64::MAX)?;

    let zero = session.get_completion(queue, 1000)?;
    assert_eq!(zero.status(), Status::Success);
    assert_eq!((zero.bytes_transferred(), zero.key(), zero.token()), (0, 0, 0));

    let max = session.get_completion(queue, 1000)?;
    assert_eq!(
        (max.bytes_transferred(), max.key(), max.token()),
        (usize::MAX, u64::MAX, u64::MAX)
    );

    let timed_out = session.get_completion(queue, 5);
    assert_eq!(timed_out.unwrap_err().status(), Status::Timeout);
    session.unregister_waiter_thread(queue)?;
    Ok(())
}

#[test]
fn active_slot_is_released_by_the_next_wait() {
    let queue = CompletionQueue::new(1);
    let mut first = queue.register_waiter().unwrap();
    let mut second = queue.register_waiter().unwrap();
    for token in 0..3 {
        queue.post_completion(0, 0, token).unwrap();
    }

    assert_eq!(first.wait(None).unwrap().token(), 0);
    let blocked = thread::spawn(move || {
        let packet = second.wait(Some(Duration::from_secs(5))).map(|p| p.token());
        (packet, second)
    });
    thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.active_waiters(), 1);

    // releasing the slot lets exactly one of the two waiters through.
    let next = first.wait(Some(Duration::from_millis(50)));
    let (other, _second) = blocked.join().unwrap();
    let mut tokens = vec![other.unwrap()];
    if let Ok(packet) = next {
        tokens.push(packet.token());
    }
    assert!(tokens.contains(&1));
    assert!(queue.active_waiters() <= 1);
}

#[test]
fn first_parked_waiter_receives_the_first_packet() {
    let queue = CompletionQueue::new(0);
    let mut first = queue.register_waiter().unwrap();
    let mut second = queue.register_waiter().unwrap();

    let early = thread::spawn(move || first.wait(Some(Duration::from_secs(5))).map(|p| p.token()));
    while queue.blocked_waiters() < 1 {
        thread::yield_now();
    }
    let late = thread::spawn(move || {
        second
            .wait(Some(Duration::from_millis(200)))
            .map(|p| p.token())
    });
    while queue.blocked_waiters() < 2 {
        thread::yield_now();
    }

    queue.post_completion(0, 0, 1).unwrap();
    assert_eq!(early.join().unwrap().unwrap(), 1);
    assert_eq!(late.join().unwrap().unwrap_err().status(), Status::Timeout);
}

#[test]
fn forged_raw_handles_are_invalid() -> Result<(), Box<dyn Error + 'static>> {
    let session = Session::builder().with_worker_threads(1).open()?;
    let queue = session.create_completion_queue(None, None, 0, 0)?;

    assert!(Handle::from_raw(0).is_none());
    assert!(Handle::from_raw(1 << 32).is_none());
    let forged = [
        Handle::from_raw(queue.as_raw() ^ (1 << 32)).ok_or("forged handle is zero")?,
        Handle::from_raw(queue.as_raw() + 1000).ok_or("forged handle is zero")?,
        Handle::from_raw(u64::MAX).ok_or("forged handle is zero")?,
    ];
    for &handle in &forged {
        assert_eq!(
            Status::of(&session.post_completion(handle, 0, 0, 0)),
            Status::InvalidHandle
        );
        assert_eq!(
            session.get_completion(handle, 0).unwrap_err().status(),
            Status::InvalidHandle
        );
        assert_eq!(Status::of(&session.close_handle(handle)), Status::InvalidHandle);
    }
    session.post_completion(queue, 0, 0, 0)?;
    Ok(())
}
