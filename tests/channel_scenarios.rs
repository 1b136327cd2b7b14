// ============================================================================
// tests/channel_scenarios.rs - チャネルキュー統合テスト
// ============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ata_xferq::{
    Channel, ChannelConfig, ChannelId, DriveId, ManualClock, QueueError, Slot, SlotMask, Xfer,
    XferFlags, XferStatus,
};

type Log = Arc<Mutex<Vec<(u32, XferStatus)>>>;

fn attach(openings: u8) -> (Channel<u32>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let config = ChannelConfig::new(openings).with_timeout(1_000);
    let channel = Channel::attach(ChannelId(0), config, Arc::clone(&clock)).unwrap();
    (channel, clock)
}

fn recorded(id: u32, flags: XferFlags, log: &Log) -> Arc<Xfer<u32>> {
    let log = Arc::clone(log);
    Arc::new(Xfer::new(DriveId(0), flags, id, move |xfer, status| {
        log.lock().unwrap().push((*xfer.context(), status));
    }))
}

/// avail / used / hold / timed_out が下位 openings ビットを分割している
fn assert_partition(channel: &Channel<u32>) {
    let state = channel.slot_state();
    assert!(state.avail.intersection(state.used).is_empty());
    assert!(
        state.is_partition(channel.openings()),
        "slot sets overlap or leak: {:?}",
        state
    );
}

#[test]
fn test_ncq_fill_and_reuse_lowest() {
    let (channel, _clock) = attach(4);
    let log: Log = Arc::default();

    for i in 0..4 {
        let slot = channel.submit(&recorded(i, XferFlags::NCQ, &log), 4).unwrap();
        assert_eq!(slot, Slot(i as u8));
    }
    assert_eq!(
        channel.submit(&recorded(4, XferFlags::NCQ, &log), 4),
        Err(QueueError::QueueFull)
    );

    assert!(channel.complete_slot(Slot(1), XferStatus::Success));
    assert_eq!(channel.slot_state().avail, Slot(1).mask());
    assert_eq!(channel.submit(&recorded(5, XferFlags::NCQ, &log), 4), Ok(Slot(1)));
    assert_eq!(
        channel.submit(&recorded(6, XferFlags::NCQ, &log), 4),
        Err(QueueError::QueueFull)
    );
    assert_partition(&channel);

    assert_eq!(*log.lock().unwrap(), vec![(1, XferStatus::Success)]);
    assert_eq!(channel.stats().queue_full, 2);
    channel.reset(XferStatus::Reset);
}

#[test]
fn test_non_ncq_drive_on_ncq_controller() {
    let (channel, _clock) = attach(4);
    let log: Log = Arc::default();

    assert_eq!(channel.submit(&recorded(0, XferFlags::empty(), &log), 1), Ok(Slot(0)));
    assert_eq!(
        channel.submit(&recorded(1, XferFlags::empty(), &log), 1),
        Err(QueueError::QueueFull)
    );
    assert_eq!(channel.slot_state().avail.count(), 3);

    // 非タグ付き完了は唯一のアクティブコマンドに解決される
    assert!(channel.complete_single(XferStatus::HardwareError(0x51)));
    assert_eq!(*log.lock().unwrap(), vec![(0, XferStatus::HardwareError(0x51))]);
    assert!(channel.is_idle());
}

#[test]
fn test_timeout_then_stray_completion() {
    let (channel, clock) = attach(4);
    let log: Log = Arc::default();
    let x = recorded(42, XferFlags::NCQ, &log);
    let slot = channel.submit(&x, 4).unwrap();

    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 1);
    assert_eq!(*log.lock().unwrap(), vec![(42, XferStatus::Timeout)]);

    // コマンドはスロットから外れ、スロットは隔離される
    assert_eq!(x.slot(), None);
    assert!(channel.lookup_by_slot(slot).is_none());
    assert_eq!(channel.slot_state().timed_out, slot.mask());
    assert_partition(&channel);

    assert!(!channel.complete_slot(slot, XferStatus::Success));
    assert_eq!(log.lock().unwrap().len(), 1);
    assert!(channel.is_idle());
    assert_eq!(channel.slot_state().avail, SlotMask::first(4));
    assert_eq!(channel.timer_deadline(), None);
}

#[test]
fn test_resubmit_after_timeout_callback() {
    let (channel, clock) = attach(4);
    let log: Log = Arc::default();
    let x = recorded(7, XferFlags::NCQ, &log);
    assert_eq!(channel.submit(&x, 4), Ok(Slot(0)));

    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 1);
    assert_eq!(x.slot(), None);

    // ドライバ層による再試行: 同じコマンドを再び投入する
    let retry_log = Arc::clone(&log);
    x.set_callback(move |xfer, status| {
        retry_log.lock().unwrap().push((*xfer.context() + 100, status));
    });
    assert_eq!(channel.submit(&x, 4), Ok(Slot(1)));
    assert!(!x.is_timed_out());
    assert!(!channel.is_halted());
    assert_partition(&channel);

    // 元のタグへの遅れた完了は再投入したコマンドに影響しない
    assert!(!channel.complete_slot(Slot(0), XferStatus::Success));
    assert_eq!(x.slot(), Some(Slot(1)));

    assert!(channel.complete_slot(Slot(1), XferStatus::Success));
    assert_eq!(
        *log.lock().unwrap(),
        vec![(7, XferStatus::Timeout), (107, XferStatus::Success)]
    );
    assert!(channel.is_idle());
}

#[test]
fn test_resubmit_from_timeout_callback() {
    let (channel, clock) = attach(1);
    let channel = Arc::new(channel);
    let handle: Arc<Mutex<Option<Arc<Xfer<u32>>>>> = Arc::default();
    let retried = Arc::new(AtomicUsize::new(0));

    let x = {
        let channel = Arc::clone(&channel);
        let handle = Arc::clone(&handle);
        let retried = Arc::clone(&retried);
        Arc::new(Xfer::new(DriveId(0), XferFlags::empty(), 0, move |_, status| {
            assert_eq!(status, XferStatus::Timeout);
            let Some(xfer) = handle.lock().unwrap().take() else {
                return;
            };
            xfer.set_callback(|_, _| {});
            // 隔離中の唯一のスロットしかないので満杯、ただし停止はしない
            assert_eq!(channel.submit(&xfer, 1), Err(QueueError::QueueFull));
            retried.fetch_add(1, Ordering::SeqCst);
        }))
    };
    *handle.lock().unwrap() = Some(Arc::clone(&x));
    channel.submit(&x, 1).unwrap();

    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 1);
    assert_eq!(retried.load(Ordering::SeqCst), 1);
    assert!(!channel.is_halted());

    // 次の満了で隔離スロットが戻り、再投入できる
    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 0);
    assert_eq!(channel.submit(&x, 1), Ok(Slot(0)));
    assert!(channel.complete_single(XferStatus::Success));
}

#[test]
fn test_capacity_returns_after_timeout_without_reset() {
    let (channel, clock) = attach(1);
    let log: Log = Arc::default();
    channel.submit(&recorded(1, XferFlags::empty(), &log), 1).unwrap();

    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 1);
    assert_eq!(
        channel.submit(&recorded(2, XferFlags::empty(), &log), 1),
        Err(QueueError::QueueFull)
    );
    // 隔離スロットが残っている間はタイマーが張られている
    assert!(channel.timer_deadline().is_some());

    clock.advance(1_000_000);
    assert_eq!(channel.poll_timeout(), 0);
    assert_eq!(channel.slot_state().avail, SlotMask::first(1));
    assert_eq!(channel.timer_deadline(), None);
    assert_eq!(
        channel.submit(&recorded(3, XferFlags::empty(), &log), 1),
        Ok(Slot(0))
    );
    assert_eq!(channel.stats().resets, 0);
    assert_partition(&channel);
    channel.reset(XferStatus::Reset);
}

#[test]
fn test_timeout_skips_already_timed_out() {
    let (channel, clock) = attach(4);
    let log: Log = Arc::default();
    channel.submit(&recorded(1, XferFlags::NCQ, &log), 4).unwrap();
    assert_eq!(channel.timer_expired(), 1);

    clock.advance(10);
    channel.submit(&recorded(2, XferFlags::NCQ, &log), 4).unwrap();
    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 1);

    assert_eq!(
        *log.lock().unwrap(),
        vec![(1, XferStatus::Timeout), (2, XferStatus::Timeout)]
    );
    assert_eq!(channel.reset(XferStatus::Reset), 0);
}

#[test]
fn test_lookup_tracks_command_until_complete() {
    let (channel, _clock) = attach(8);
    let log: Log = Arc::default();
    let xfers: Vec<_> = (0..8).map(|i| recorded(i, XferFlags::NCQ, &log)).collect();
    let slots: Vec<_> = xfers.iter().map(|x| channel.submit(x, 8).unwrap()).collect();

    for (x, slot) in xfers.iter().zip(&slots) {
        assert_eq!(x.slot(), Some(*slot));
        assert!(Arc::ptr_eq(&channel.lookup_by_slot(*slot).unwrap(), x));
    }
    for (x, slot) in xfers.iter().zip(&slots).rev() {
        assert!(channel.complete(x, XferStatus::Success));
        assert_eq!(x.slot(), None);
        assert!(channel.slot_state().avail.contains(*slot));
    }
    assert_eq!(channel.stats().completed, 8);
}

#[test]
#[should_panic(expected = "unknown slot")]
fn test_lookup_of_unissued_tag_is_fatal() {
    let (channel, _clock) = attach(4);
    let log: Log = Arc::default();
    channel.submit(&recorded(0, XferFlags::NCQ, &log), 4).unwrap();
    let _ = channel.lookup_by_slot(Slot(3));
}

#[test]
#[should_panic(expected = "inactive command")]
fn test_double_completion_is_fatal() {
    let (channel, _clock) = attach(4);
    let log: Log = Arc::default();
    let x = recorded(0, XferFlags::NCQ, &log);
    channel.submit(&x, 4).unwrap();
    channel.complete(&x, XferStatus::Success);
    channel.complete(&x, XferStatus::Success);
}

#[test]
fn test_hold_release_is_lossless() {
    let (channel, _clock) = attach(16);
    let log: Log = Arc::default();
    for i in 0..9 {
        channel.submit(&recorded(i, XferFlags::NCQ, &log), 16).unwrap();
    }
    channel.complete_slot(Slot(3), XferStatus::Success);
    channel.complete_slot(Slot(7), XferStatus::Success);
    let before = channel.slot_state();

    {
        let mut guard = channel.lock();
        guard.hold_all();
        assert!(guard.slot_state().used.is_empty());
        assert_eq!(guard.slot_state().hold, before.used);
        guard.release_hold();
    }
    assert_eq!(channel.slot_state(), before);
    channel.reset(XferStatus::Reset);
}

#[test]
fn test_every_callback_fires_exactly_once() {
    let (channel, clock) = attach(8);
    let calls = Arc::new(AtomicUsize::new(0));
    let make = |i: u32| {
        let calls = Arc::clone(&calls);
        Arc::new(Xfer::new(DriveId(0), XferFlags::NCQ, i, move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        }))
    };

    let xfers: Vec<_> = (0..8).map(make).collect();
    for x in &xfers {
        channel.submit(x, 8).unwrap();
    }
    // 正常完了、タイムアウト、遅延完了、リセットが混在
    channel.complete(&xfers[0], XferStatus::Success);
    channel.complete(&xfers[1], XferStatus::HardwareError(0x04));
    clock.advance(1_000);
    assert_eq!(channel.poll_timeout(), 6);
    channel.complete(&xfers[2], XferStatus::Success);
    channel.complete(&xfers[3], XferStatus::Success);
    assert_eq!(channel.reset(XferStatus::Reset), 0);

    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert!(channel.is_idle());
    assert_partition(&channel);
}

#[test]
fn test_pseudo_random_sequence_keeps_partition() {
    let (channel, _clock) = attach(12);
    let log: Log = Arc::default();
    let mut active: Vec<Arc<Xfer<u32>>> = Vec::new();
    let mut seed: u32 = 0x1234_5678;
    let mut next = || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        seed >> 16
    };

    for i in 0..2_000 {
        let roll = next();
        if roll % 3 != 0 {
            let drive_openings = (next() % 12) as u8 + 1;
            let x = recorded(i, XferFlags::NCQ, &log);
            match channel.submit(&x, drive_openings) {
                Ok(slot) => {
                    assert!(slot.as_u8() < drive_openings);
                    active.push(x);
                }
                Err(err) => assert_eq!(err, QueueError::QueueFull),
            }
        } else if !active.is_empty() {
            let idx = next() as usize % active.len();
            let x = active.swap_remove(idx);
            assert!(channel.complete(&x, XferStatus::Success));
        }
        assert_partition(&channel);
        assert_eq!(channel.active_count(), active.len());
    }
    channel.reset(XferStatus::Reset);
}

#[test]
fn test_concurrent_submit_and_complete() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 500;

    let (channel, _clock) = attach(8);
    let channel = Arc::new(channel);
    let fired = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let channel = Arc::clone(&channel);
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let fired = Arc::clone(&fired);
                    let x = Arc::new(Xfer::new(
                        DriveId(t as u8),
                        XferFlags::NCQ,
                        t * PER_THREAD + i,
                        move |_, status| {
                            assert_eq!(status, XferStatus::Success);
                            fired.fetch_add(1, Ordering::SeqCst);
                        },
                    ));
                    let slot = loop {
                        match channel.submit(&x, 8) {
                            Ok(slot) => break slot,
                            Err(QueueError::QueueFull) => thread::yield_now(),
                            Err(err) => panic!("unexpected submit error: {}", err),
                        }
                    };
                    assert!(Arc::ptr_eq(&channel.lookup_by_slot(slot).unwrap(), &x));
                    assert!(channel.complete_slot(slot, XferStatus::Success));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fired.load(Ordering::SeqCst), (THREADS * PER_THREAD) as usize);
    assert!(channel.is_idle());
    assert_eq!(channel.slot_state().avail, SlotMask::first(8));
    let stats = channel.stats();
    assert_eq!(stats.submitted, (THREADS * PER_THREAD) as u64);
    assert_eq!(stats.completed, (THREADS * PER_THREAD) as u64);
}
