// SPDX-License-Identifier: Apache-2.0

use crate::state::{event, is};

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
//#        o
//#       | Create Stream (Sending)
//#       v
//#   +-------+
//#   | Ready | Send RESET_STREAM
//#   |       |-----------------------.
//#   +-------+                       |
//#       |                           |
//#       | Send STREAM /             |
//#       |      STREAM_DATA_BLOCKED  |
//#       v                           |
//#   +-------+                       |
//#   | Send  | Send RESET_STREAM     |
//#   |       |---------------------->|
//#   +-------+                       |
//#       |                           |
//#       | Send STREAM + FIN         |
//#       v                           v
//#   +-------+                   +-------+
//#   | Data  | Send RESET_STREAM | Reset |
//#   | Sent  |------------------>| Sent  |
//#   +-------+                   +-------+
//#       |                           |
//#       | Recv All ACKs             | Recv ACK
//#       v                           v
//#   +-------+                   +-------+
//#   | Data  |                   | Reset |
//#   | Recvd |                   | Recvd |
//#   +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sender {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    /// Separates "we decided to reset" from "the RESET_STREAM frame went out"
    /// so the assembler can still find the stream when it drains the
    /// standalone-reset queue.
    ResetQueued,
    ResetSent,
    ResetRecvd,
}

impl Sender {
    is!(is_ready, Ready);
    is!(is_sending, Send);
    is!(is_data_sent, DataSent);
    is!(is_data_received, DataRecvd);
    is!(is_reset_queued, ResetQueued);
    is!(is_reset_sent, ResetSent);
    is!(is_reset_received, ResetRecvd);
    is!(is_terminal, DataRecvd | ResetRecvd);

    event! {
        on_send_stream(Ready => Send);
        on_send_fin(Ready | Send => DataSent);
        on_recv_all_acks(DataSent | ResetQueued => DataRecvd);

        on_queue_reset(Ready | Send | DataSent => ResetQueued);
        on_send_reset(Ready | Send | DataSent | ResetQueued => ResetSent);
        on_recv_reset_ack(ResetSent => ResetRecvd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_to_send_to_data_sent() {
        let mut s = Sender::Ready;
        s.on_send_stream().unwrap();
        assert!(s.is_sending());
        s.on_send_fin().unwrap();
        assert!(s.is_data_sent());
        s.on_recv_all_acks().unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn reset_path_is_reachable_from_every_pre_terminal_state() {
        for mut s in [Sender::Ready, Sender::Send, Sender::DataSent] {
            s.on_queue_reset().unwrap();
            assert!(s.is_reset_queued());
            s.on_send_reset().unwrap();
            assert!(s.is_reset_sent());
            s.on_recv_reset_ack().unwrap();
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn data_recvd_is_terminal() {
        let mut s = Sender::DataRecvd;
        assert!(s.on_send_stream().is_err());
        assert!(s.on_queue_reset().is_err());
    }
}
