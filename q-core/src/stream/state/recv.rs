// SPDX-License-Identifier: Apache-2.0

use crate::state::{event, is};

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
//#        o
//#       | Recv STREAM / STREAM_DATA_BLOCKED / RESET_STREAM
//#       v
//#   +-------+
//#   | Recv  | Recv RESET_STREAM
//#   |       |-----------------------.
//#   +-------+                       |
//#       |                           |
//#       | Recv STREAM + FIN         |
//#       v                           |
//#   +-------+                       |
//#   | Size  | Recv RESET_STREAM     |
//#   | Known |---------------------->|
//#   +-------+                       |
//#       |                           |
//#       | Recv All Data             |
//#       v                           v
//#   +-------+                   +-------+
//#   | Data  |                   | Reset |
//#   | Recvd |                   | Recvd |
//#   +-------+                   +-------+
//#       |                           |
//#       | App Read All Data         | App Read Reset
//#       v                           v
//#   +-------+                   +-------+
//#   | Data  |                   | Reset |
//#   | Read  |                   | Read  |
//#   +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Receiver {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl Receiver {
    is!(is_receiving, Recv);
    is!(is_size_known, SizeKnown);
    is!(is_data_received, DataRecvd);
    is!(is_data_read, DataRead);
    is!(is_reset_received, ResetRecvd);
    is!(is_reset_read, ResetRead);
    is!(is_terminal, DataRead | ResetRead);

    event! {
        on_receive_fin(Recv => SizeKnown);
        on_receive_all_data(SizeKnown => DataRecvd);
        on_app_read_all_data(DataRecvd => DataRead);

        on_reset(Recv | SizeKnown => ResetRecvd);
        on_app_read_reset(ResetRecvd => ResetRead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_receive_path() {
        let mut r = Receiver::Recv;
        r.on_receive_fin().unwrap();
        r.on_receive_all_data().unwrap();
        r.on_app_read_all_data().unwrap();
        assert!(r.is_terminal());
    }

    #[test]
    fn reset_overrides_size_known() {
        let mut r = Receiver::Recv;
        r.on_receive_fin().unwrap();
        r.on_reset().unwrap();
        assert!(r.is_reset_received());
        r.on_app_read_reset().unwrap();
        assert!(r.is_terminal());
    }

    #[test]
    fn cannot_reset_after_data_recvd() {
        let mut r = Receiver::DataRecvd;
        assert!(r.on_reset().is_err());
    }
}
