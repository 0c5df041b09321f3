//! Fuzz target for InputTimeline.
//!
//! Runs arbitrary operation sequences and checks that `set` never rewrites a recorded slot and
//! that the change watermark only moves backwards until it is cleared.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use netplay_rollback::{IndexedFrame, InputTimeline};

#[derive(Debug, Arbitrary)]
enum Op {
    Set { index: u8, frame: u8, value: u16 },
    Assign { index: u8, frame: u8, value: u16 },
    SetRange { index: u8, start: u8, values: Vec<u16>, check_from: u8 },
    Resize { index: u8, end_frame: u8 },
    Erase { index: u8 },
    ClearWatermark,
    Get { index: u8, frame: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut timeline = InputTimeline::<u16>::new();
    let mut watermark = IndexedFrame::MAX;

    for op in ops.iter().take(512) {
        match *op {
            Op::Set { index, frame, value } => {
                let (index, frame) = (u32::from(index % 8), u32::from(frame));
                let before = (index < timeline.end_index() && frame < timeline.end_frame_of(index))
                    .then(|| timeline.get(index, frame));
                timeline.set(index, frame, value);
                if let Some(before) = before {
                    assert_eq!(timeline.get(index, frame), before);
                }
            },
            Op::Assign { index, frame, value } => {
                let (index, frame) = (u32::from(index % 8), u32::from(frame));
                timeline.assign(index, frame, value);
                assert_eq!(timeline.get(index, frame), value);
            },
            Op::SetRange {
                index,
                start,
                ref values,
                check_from,
            } => {
                let values = &values[..values.len().min(64)];
                timeline.set_range(
                    u32::from(index % 8),
                    u32::from(start),
                    values,
                    u32::from(check_from % 8),
                );
            },
            Op::Resize { index, end_frame } => {
                timeline.resize(u32::from(index % 8), u32::from(end_frame));
            },
            Op::Erase { index } => {
                timeline.erase_index_older_than(u32::from(index % 8));
                watermark = timeline.last_changed_frame();
            },
            Op::ClearWatermark => {
                timeline.clear_last_changed_frame();
                watermark = IndexedFrame::MAX;
            },
            Op::Get { index, frame } => {
                let _ = timeline.get(u32::from(index), u32::from(frame));
            },
        }
        let now = timeline.last_changed_frame();
        assert!(now <= watermark);
        watermark = now;
    }
});
