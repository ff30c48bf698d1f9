//! Framing tests across the protocol modules.

use bytes::Bytes;
use sqlite_share::codec::MsgPackCodec;
use sqlite_share::protocol::{
    CorrelatedEnvelope, FrameAssembler, FrameError, MessageKind, WireFrame, HEADER_SIZE,
};

fn sample_frames() -> Vec<WireFrame> {
    vec![
        WireFrame::empty(MessageKind::UnlockConnectionRequest),
        WireFrame::from_scalar(MessageKind::ExecuteNonQueryResponseSuccess, 2i64),
        WireFrame::from_scalar(MessageKind::CreateCommandResponse, "0f8fad5b-d9cb-469f-a165-70867728950e"),
        WireFrame::with_payload(MessageKind::ExecuteReaderGetRowResponse, vec![7u8; 5000]),
        WireFrame::from_scalar(MessageKind::ExecuteRequestResponse, true),
    ]
}

fn concat(frames: &[WireFrame]) -> Vec<u8> {
    frames.iter().flat_map(|f| f.encode().to_vec()).collect()
}

#[test]
fn test_frames_survive_encode_decode() {
    for frame in sample_frames() {
        let decoded = WireFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}

#[test]
fn test_truncated_buffers_rejected() {
    assert!(matches!(
        WireFrame::decode(&[0, 1]),
        Err(FrameError::TooShort { len: 2 })
    ));
    assert!(matches!(
        WireFrame::decode(&[1, 0, 0, 0, 2, 0, 0, 0]),
        Err(FrameError::SizeMismatch { declared: 1, actual: 0 })
    ));
}

#[test]
fn test_assembler_single_call() {
    let frames = sample_frames();
    let mut assembler = FrameAssembler::new();

    assembler.queue(&concat(&frames)).unwrap();
    assert_eq!(assembler.drain(), frames);
    assert!(assembler.drain().is_empty());
}

#[test]
fn test_assembler_arbitrary_splits() {
    let frames = sample_frames();
    let bytes = concat(&frames);

    for chunk_size in [1, 3, HEADER_SIZE - 1, HEADER_SIZE + 1, 977, 4096] {
        let mut assembler = FrameAssembler::new();
        let mut out = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            assembler.queue(chunk).unwrap();
            out.extend(assembler.drain());
        }
        assert_eq!(out, frames, "chunk size {}", chunk_size);
        assert!(assembler.is_empty());
    }
}

#[test]
fn test_envelope_inside_frame() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Request {
        command_id: String,
        timeout_ms: u64,
    }

    let record = Request {
        command_id: "abc".into(),
        timeout_ms: 30_000,
    };
    let inner = Bytes::from(MsgPackCodec::encode(&record).unwrap());
    let envelope = CorrelatedEnvelope::new(MessageKind::ExecuteReaderRequest, Some(inner));
    let id = envelope.correlation_id().clone();

    let outer = envelope.into_frame(MessageKind::SendAndWaitRequest);
    let mut assembler = FrameAssembler::new();
    for byte in outer.encode().iter() {
        assembler.queue(&[*byte]).unwrap();
    }
    let received = assembler.drain().pop().unwrap();

    let unwrapped = CorrelatedEnvelope::from_frame(&received).unwrap();
    assert_eq!(unwrapped.correlation_id(), &id);
    let decoded: Request = unwrapped.to_frame().record().unwrap();
    assert_eq!(decoded, record);
}

#[test]
fn test_invalid_correlation_id() {
    let result = CorrelatedEnvelope::with_id(MessageKind::SendAndWaitBusy, None, Some("Invalid"));
    assert!(result.is_err());
    let result = CorrelatedEnvelope::with_id(MessageKind::SendAndWaitBusy, None, None);
    assert!(result.is_err());
}
