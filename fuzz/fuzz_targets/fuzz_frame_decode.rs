//! Fuzzes the Moza frame decoder and the stream resynchronizer with
//! arbitrary serial bytes.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_frame_decode
#![no_main]
use libfuzzer_sys::fuzz_target;
use racing_wheel_moza_serial_protocol::{
    DecodeOutcome, FrameCodec, MAX_FRAME_LEN, Response, StreamDecoder,
};

fuzz_target!(|data: &[u8]| {
    let codec = FrameCodec::moza();
    match codec.decode(data) {
        DecodeOutcome::Frame { frame, consumed } => {
            assert!(consumed <= data.len());
            assert_eq!(frame.wire_len(), consumed);
            let _ = Response::from_frame(&frame);
        }
        DecodeOutcome::Invalid { discard, .. } => {
            assert!(discard >= 1 && discard <= data.len());
        }
        DecodeOutcome::NeedMoreData => {}
    }

    // Feed in uneven chunks; every byte must eventually be consumed.
    let mut decoder = StreamDecoder::new(FrameCodec::moza());
    for chunk in data.chunks(7) {
        decoder.extend(chunk);
        while let Some(event) = decoder.next_event() {
            if let Ok(frame) = event {
                let _ = Response::from_frame(&frame);
            }
        }
        assert!(decoder.buffered() < MAX_FRAME_LEN);
    }
});
