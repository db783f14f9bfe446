//! PDU send and receive
//!
//! Sending is two ordered calls: the header, then the data segment.
//!
//! Receiving is a probe-then-fetch exchange. The first call pulls the header
//! and tells us whether a PDU is available; only then is the data length
//! known, so the data buffer is allocated and filled by a second call. The
//! intermediate state is [`HeaderProbed`], which callers never see: the only
//! way to fetch data is through a header probe.

use crate::channel::ControlChannel;
use crate::engine::{EngineService, ReturnCode, Selector};
use crate::error::{errno, KernelError, KernelResult};
use crate::pdu::{BasicHeaderSegment, DataSegment, BHS_SIZE};
use crate::resources::{ConnectionId, SessionId};

/// A header has been read; `data_len` bytes of data segment are pending
#[derive(Debug)]
struct HeaderProbed {
    session: SessionId,
    connection: ConnectionId,
    data_len: usize,
}

impl HeaderProbed {
    fn fetch_data<S: EngineService>(
        self,
        channel: &ControlChannel<S>,
    ) -> KernelResult<DataSegment> {
        // Header-only PDU
        if self.data_len == 0 {
            return Ok(DataSegment::empty());
        }

        let mut segment = DataSegment::allocate(self.data_len)?;

        // On any early return below, `segment` is dropped and its buffer freed
        let mut status = [0u64; 1];
        let output = channel.invoke(
            Selector::RecvData,
            &[self.session.get() as u64, self.connection.get() as u64],
            &[],
            &mut status,
            &mut segment,
        )?;

        if status[0] != 0 {
            return Err(KernelError::Io(format!(
                "{} reported status {}",
                Selector::RecvData,
                status[0]
            )));
        }
        if output.struct_len != self.data_len {
            return Err(KernelError::Io(format!(
                "{} transferred {} bytes, expected {}",
                Selector::RecvData,
                output.struct_len,
                self.data_len
            )));
        }

        Ok(segment)
    }
}

impl<S: EngineService> ControlChannel<S> {
    /// Send one PDU on a connection
    ///
    /// `data` is the data segment as it should appear on the wire; an empty
    /// slice sends a header-only PDU. If the engine refuses the header, the
    /// data is not sent.
    pub fn send(
        &self,
        session: SessionId,
        connection: ConnectionId,
        header: &BasicHeaderSegment,
        data: &[u8],
    ) -> KernelResult<()> {
        self.resources().check_connection(session, connection)?;
        self.trace_header("send", session, connection, header);

        self.call(Selector::SendHeader, &[], header.as_bytes(), &mut [], &mut [])
            .map_err(|rc| rejected(Selector::SendHeader, rc))?;

        let mut status = [0u64; 1];
        let output = self
            .call(
                Selector::SendData,
                &[session.get() as u64, connection.get() as u64],
                data,
                &mut status,
                &mut [],
            )
            .map_err(|rc| rejected(Selector::SendData, rc))?;

        if output.scalar_count != status.len() {
            return Err(KernelError::InvalidArgument(format!(
                "{} produced {} scalar outputs, expected {}",
                Selector::SendData,
                output.scalar_count,
                status.len()
            )));
        }

        match status[0] {
            0 => Ok(()),
            code => Err(KernelError::Status {
                operation: "SendData",
                code: i32::try_from(code).unwrap_or(errno::EIO),
            }),
        }
    }

    /// Receive one PDU from a connection
    ///
    /// The header is written into `header`; the data segment, padding
    /// included, is returned. A header-only PDU returns an empty segment
    /// without allocating.
    pub fn receive(
        &self,
        session: SessionId,
        connection: ConnectionId,
        header: &mut BasicHeaderSegment,
    ) -> KernelResult<DataSegment> {
        self.resources().check_connection(session, connection)?;

        let probed = self.probe_header(session, connection, header)?;
        probed.fetch_data(self)
    }

    fn probe_header(
        &self,
        session: SessionId,
        connection: ConnectionId,
        header: &mut BasicHeaderSegment,
    ) -> KernelResult<HeaderProbed> {
        let mut raw = [0u8; BHS_SIZE];
        let mut status = [0u64; 1];
        let output = self.invoke(
            Selector::RecvHeader,
            &[session.get() as u64, connection.get() as u64],
            &[],
            &mut status,
            &mut raw,
        )?;

        if status[0] != 0 {
            return Err(KernelError::Io(format!(
                "{} reported status {}",
                Selector::RecvHeader,
                status[0]
            )));
        }
        if output.struct_len != BHS_SIZE {
            return Err(KernelError::Io(format!(
                "{} transferred {} bytes, expected {}",
                Selector::RecvHeader,
                output.struct_len,
                BHS_SIZE
            )));
        }

        *header = BasicHeaderSegment::from_bytes(&raw)?;
        self.trace_header("recv", session, connection, header);

        Ok(HeaderProbed {
            session,
            connection,
            data_len: header.padded_data_segment_length(),
        })
    }

    fn trace_header(
        &self,
        direction: &str,
        session: SessionId,
        connection: ConnectionId,
        header: &BasicHeaderSegment,
    ) {
        if self.config().trace_pdus {
            log::trace!(
                "{} {} on {}/{}: {}",
                direction,
                header.opcode_name(),
                session,
                connection,
                hex::encode(header.as_bytes())
            );
        }
    }
}

fn rejected(selector: Selector, rc: ReturnCode) -> KernelError {
    KernelError::InvalidArgument(format!("{} rejected by engine: {}", selector, rc))
}
