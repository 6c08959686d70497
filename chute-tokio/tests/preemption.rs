//! A repeated request for the in-flight chunk must redirect the cursor:
//! the very next packet the sender emits carries the requested sequence
//! number, and nothing from the abandoned cursor follows it.

use std::{path::Path, time::Duration};

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use tokio::{net::UdpSocket, time::timeout};

use chute_protocol::packet::{
    Ack, ChunkId, ControlMessage, Packet, PacketPayload, SeqNo, StreamId, TransferRequest,
    DATAGRAM_SIZE, MAX_PAYLOAD,
};
use chute_tokio::{SenderConfig, SenderService};

const STREAM: StreamId = StreamId(7);
const SEEK_TO: u64 = 50;

fn write_chunk(root: &Path, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    SmallRng::seed_from_u64(0x5ee4 ^ len as u64).fill_bytes(&mut bytes);
    std::fs::create_dir_all(root.join("video5")).unwrap();
    std::fs::write(root.join("video5/1.m4s"), &bytes).unwrap();
    bytes
}

fn request(start_seq: u64) -> Vec<u8> {
    ControlMessage::Transfer(TransferRequest {
        stream: STREAM,
        path: "video5/1.m4s".to_string(),
        start_seq: SeqNo(start_seq),
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn seek_redirects_the_next_packet() {
    let _ = pretty_env_logger::try_init();

    let dir = tempfile::tempdir().unwrap();
    let file = write_chunk(dir.path(), 200_000);
    let fin_seq = (file.len() / MAX_PAYLOAD + 1) as u64;

    let sender = SenderService::bind(SenderConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ack_bind: "127.0.0.1:0".parse().unwrap(),
        storage_root: dir.path().to_path_buf(),
    })
    .await
    .unwrap();

    let data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let acks = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    data.send_to(&request(0), sender.control_addr()).await.unwrap();

    let run = async {
        let mut buf = vec![0u8; DATAGRAM_SIZE];
        let mut expected: u64 = 0;
        let mut seeked = false;
        let mut seek_applied = false;
        let mut tail = Vec::new();

        loop {
            let (n, _) = data.recv_from(&mut buf).await.unwrap();
            let pkt = match Packet::parse(&mut &buf[..n]) {
                Ok(pkt) => pkt,
                Err(_) => continue,
            };
            assert_eq!(pkt.chunk_id, ChunkId(1));
            let seq = pkt.seq_no.0;

            if seek_applied {
                // nothing from the abandoned cursor may follow the seek
                assert!(seq >= SEEK_TO, "pre-seek seq {} after the seek took effect", seq);
            } else if seeked {
                if seq < SEEK_TO {
                    // still in flight from before the seek landed
                    continue;
                }
                seek_applied = true;
            }

            if seq != expected {
                continue;
            }
            match pkt.payload {
                PacketPayload::Fin => {
                    assert_eq!(seq, fin_seq);
                    send_ack(&acks, sender.ack_addr(), seq, true).await;
                    break;
                }
                PacketPayload::Data(bytes) => {
                    if seeked {
                        tail.extend_from_slice(&bytes);
                    }
                    send_ack(&acks, sender.ack_addr(), seq, false).await;
                    expected += 1;
                }
            }

            if !seeked && expected == 5 {
                data.send_to(&request(SEEK_TO), sender.control_addr())
                    .await
                    .unwrap();
                expected = SEEK_TO;
                seeked = true;
            }
        }
        tail
    };

    let tail = timeout(Duration::from_secs(30), run).await.unwrap();
    assert_eq!(&tail[..], &file[SEEK_TO as usize * MAX_PAYLOAD..]);
}

async fn send_ack(socket: &UdpSocket, to: std::net::SocketAddr, seq: u64, is_last: bool) {
    let ack = Ack {
        stream: STREAM,
        chunk_id: ChunkId(1),
        seq_no: SeqNo(seq),
        is_last,
    };
    socket.send_to(ack.to_string().as_bytes(), to).await.unwrap();
}
