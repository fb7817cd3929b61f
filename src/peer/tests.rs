use super::*;
use bytes::Bytes;

#[test]
fn handshake_encode_decode() {
    let handshake = Handshake::new(1007);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(&encoded[..18], HANDSHAKE_HEADER);
    assert_eq!(&encoded[18..28], &[0u8; 10][..]);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.peer_id, 1007);
}

#[test]
fn handshake_rejects_bad_header() {
    let mut encoded = Handshake::new(1).encode().to_vec();
    encoded[0] = b'X';
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn handshake_rejects_short_input() {
    let encoded = Handshake::new(1).encode();
    assert!(matches!(
        Handshake::decode(&encoded[..HANDSHAKE_LEN - 1]),
        Err(PeerError::InvalidHandshake)
    ));
}

/// Strips the 4-byte length prefix, leaving what the listener hands to
/// `Packet::decode`.
fn wire_payload(packet: &Packet) -> Bytes {
    let framed = packet.encode();
    let length = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    assert_eq!(framed.len(), 4 + length, "length header must cover the frame");
    framed.slice(4..)
}

#[test]
fn packet_encode_decode() {
    let packets = vec![
        Packet::Choke,
        Packet::Unchoke,
        Packet::Interested,
        Packet::NotInterested,
        Packet::Have { piece: 42 },
        Packet::Bitfield(Bytes::from_static(&[0xA5, 0x80])),
        Packet::Request { piece: 7 },
    ];

    for packet in packets {
        let decoded = Packet::decode(wire_payload(&packet)).unwrap();
        assert_eq!(decoded, packet);
    }
}

#[test]
fn piece_packet_carries_content() {
    let data = Bytes::from_static(b"piece content here");
    let packet = Packet::Piece {
        piece: 3,
        data: data.clone(),
    };

    let decoded = Packet::decode(wire_payload(&packet)).unwrap();
    if let Packet::Piece {
        piece,
        data: decoded_data,
    } = decoded
    {
        assert_eq!(piece, 3);
        assert_eq!(decoded_data, data);
    } else {
        panic!("expected piece packet");
    }
}

#[test]
fn frame_length_counts_type_byte() {
    let framed = Packet::Choke.encode();
    assert_eq!(framed.len(), 5);
    assert_eq!(&framed[..4], &[0, 0, 0, 1]);
    assert_eq!(framed[4], PacketType::Choke as u8);

    let framed = Packet::Have { piece: 1 }.encode();
    assert_eq!(framed.len(), 9);
    assert_eq!(&framed[..4], &[0, 0, 0, 5]);
}

#[test]
fn decode_rejects_garbage() {
    assert!(matches!(
        Packet::decode(Bytes::new()),
        Err(PeerError::InvalidPacket(_))
    ));
    assert!(matches!(
        Packet::decode(Bytes::from_static(&[99])),
        Err(PeerError::InvalidPacketId(99))
    ));
    // HAVE with a truncated index.
    assert!(matches!(
        Packet::decode(Bytes::from_static(&[4, 0, 0])),
        Err(PeerError::InvalidPacket(_))
    ));
}

#[test]
fn bitfield_set_and_query() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    bf.set(0);
    bf.set(99);
    assert!(bf.has(0));
    assert!(bf.has(99));
    assert!(!bf.has(100));
    assert_eq!(bf.count_ones(), 2);
    assert!(!bf.is_complete());
}

#[test]
fn bitfield_from_bytes_is_msb_first() {
    let bf = Bitfield::from_bytes(&[0x80, 0x01], 16);
    assert!(bf.has(0));
    assert!(!bf.has(1));
    assert!(bf.has(15));
}

#[test]
fn bitfield_ignores_trailing_bits() {
    // 10 pieces in 2 bytes: the low 6 bits of the second byte are spare.
    let bf = Bitfield::from_bytes(&[0xFF, 0xFF], 10);
    assert_eq!(bf.count_ones(), 10);
    assert!(bf.is_complete());
    assert_eq!(&bf.to_bytes()[..], &[0xFF, 0xC0]);
}

#[test]
fn bitfield_wire_width() {
    assert_eq!(Bitfield::new(8).to_bytes().len(), 1);
    assert_eq!(Bitfield::new(9).to_bytes().len(), 2);
    // Short wire input is padded out rather than rejected.
    let bf = Bitfield::from_bytes(&[0xFF], 16);
    assert_eq!(bf.count_ones(), 8);
}

#[test]
fn connection_state_starts_choked_both_ways() {
    let state = ConnectionState::new(None, 8);
    assert!(state.is_local_choked());
    assert!(state.is_remote_choked());
    assert!(!state.is_interested());
    assert!(!state.has_sent_bitfield());
    assert!(!state.is_handshaken());
    assert!(state.is_active());
    assert_eq!(state.remote_peer_id(), None);
}

#[test]
fn connection_state_tracks_single_pending_request() {
    let state = ConnectionState::new(Some(1002), 8);

    assert_eq!(state.pending_request(), None);
    state.set_pending_request(5);
    assert_eq!(state.pending_request(), Some(5));

    // Clearing a different piece leaves the marker alone.
    state.clear_pending_request(4);
    assert_eq!(state.pending_request(), Some(5));
    state.clear_pending_request(5);
    assert_eq!(state.pending_request(), None);

    state.set_pending_request(2);
    assert_eq!(state.take_pending_request(), Some(2));
    assert_eq!(state.take_pending_request(), None);
}

#[test]
fn connection_state_download_counter_resets() {
    let state = ConnectionState::new(Some(1002), 8);
    state.add_downloaded(100);
    state.add_downloaded(50);
    assert_eq!(state.downloaded(), 150);

    state.reset_downloaded();
    assert_eq!(state.downloaded(), 0);
}

#[test]
fn remote_view_updates() {
    let state = ConnectionState::new(Some(1002), 4);
    assert!(!state.remote_complete());

    let mut view = Bitfield::new(4);
    view.set(0);
    view.set(1);
    view.set(2);
    state.set_remote_pieces(view);
    assert!(!state.remote_complete());

    state.record_remote_have(3);
    assert!(state.remote_complete());
    assert!(state.remote_pieces().has(3));
}
