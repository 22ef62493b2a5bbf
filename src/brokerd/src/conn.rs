//! Per-connection state machine.
//!
//! A connection accumulates one 24-byte request frame at a time, dispatches
//! it, and queues responses for delivery when the socket is writable. A
//! write request detours through a payload-receive phase that may span many
//! readiness events. Connections that request a remote vSSD additionally
//! carry the materialized vblk table their block indices refer to.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use ocnvm::{DeviceError, PhysAddr, Vblk};
use vssd::{AllocRequest, Vssd};

use super::proto::{self, defs::REQUEST_SIZE, Request};
use super::server::BrokerCtx;

/// What the worker should do with the connection after a service round.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnOutcome {
    /// Rearm for readability; also for writability when responses are
    /// still queued.
    Rearm { writable: bool },
    Close,
}

enum Flow {
    Continue,
    WouldBlock,
    Close,
}

enum Phase {
    Command,
    WritePayload {
        block_index: u32,
        buf: Vec<u8>,
        filled: usize,
    },
}

struct PendingWrite {
    buf: Vec<u8>,
    offset: usize,
}

/// vblk table of a remote session. Block indices on the wire index into
/// `vblks` in materialization order.
pub(crate) struct RemoteSession {
    pub(crate) vblks: Vec<Box<dyn Vblk>>,
    pub(crate) vblk_nbytes: u64,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    cmd_buf: [u8; REQUEST_SIZE],
    cmd_filled: usize,
    phase: Phase,
    writeq: VecDeque<PendingWrite>,
    session: Option<RemoteSession>,
    ctx: Arc<BrokerCtx>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, ctx: Arc<BrokerCtx>) -> Self {
        info!(%peer, "new connection");
        Self {
            stream,
            peer,
            cmd_buf: [0; REQUEST_SIZE],
            cmd_filled: 0,
            phase: Phase::Command,
            writeq: VecDeque::new(),
            session: None,
            ctx,
        }
    }

    /// One service round: drain queued responses, then consume the socket
    /// until it would block, dispatching every completed frame.
    pub fn process(&mut self) -> ConnOutcome {
        if let Flow::Close = self.flush_writeq() {
            return ConnOutcome::Close;
        }

        loop {
            let flow = match self.phase {
                Phase::Command => self.read_command(),
                Phase::WritePayload { .. } => self.read_payload(),
            };
            match flow {
                Flow::Continue => continue,
                Flow::WouldBlock => break,
                Flow::Close => return ConnOutcome::Close,
            }
        }

        if let Flow::Close = self.flush_writeq() {
            return ConnOutcome::Close;
        }
        ConnOutcome::Rearm {
            writable: !self.writeq.is_empty(),
        }
    }

    fn flush_writeq(&mut self) -> Flow {
        while let Some(pending) = self.writeq.front_mut() {
            match self.stream.write(&pending.buf[pending.offset..]) {
                Ok(n) => {
                    pending.offset += n;
                    if pending.offset == pending.buf.len() {
                        self.writeq.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Flow::WouldBlock,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(peer = %self.peer, "socket write failed: {e}");
                    return Flow::Close;
                }
            }
        }
        Flow::Continue
    }

    fn read_command(&mut self) -> Flow {
        while self.cmd_filled < REQUEST_SIZE {
            match self.stream.read(&mut self.cmd_buf[self.cmd_filled..]) {
                Ok(0) => {
                    debug!(peer = %self.peer, "peer closed");
                    return Flow::Close;
                }
                Ok(n) => self.cmd_filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Flow::WouldBlock,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(peer = %self.peer, "socket read failed: {e}");
                    return Flow::Close;
                }
            }
        }

        self.cmd_filled = 0;
        let frame = self.cmd_buf;
        match proto::parse(&frame) {
            Ok(request) => self.dispatch(request),
            Err(e) => {
                warn!(peer = %self.peer, "dropping connection: {e}");
                Flow::Close
            }
        }
    }

    fn read_payload(&mut self) -> Flow {
        match &mut self.phase {
            Phase::WritePayload { buf, filled, .. } => {
                while *filled < buf.len() {
                    match self.stream.read(&mut buf[*filled..]) {
                        Ok(0) => {
                            debug!(peer = %self.peer, "peer closed mid-payload");
                            return Flow::Close;
                        }
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Flow::WouldBlock,
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!(peer = %self.peer, "socket read failed: {e}");
                            return Flow::Close;
                        }
                    }
                }
            }
            Phase::Command => return Flow::Continue,
        }

        let Phase::WritePayload {
            block_index, buf, ..
        } = mem::replace(&mut self.phase, Phase::Command)
        else {
            unreachable!();
        };
        self.finish_write(block_index, &buf)
    }

    fn dispatch(&mut self, request: Request) -> Flow {
        match request {
            Request::Alloc(request) => self.dispatch_alloc(&request),
            Request::Read {
                block_index,
                count,
                offset,
            } => self.dispatch_read(block_index, count, offset),
            Request::Write { block_index, count } => self.dispatch_write(block_index, count),
            Request::Erase { block_index } => self.dispatch_erase(block_index),
        }
    }

    fn dispatch_alloc(&mut self, request: &AllocRequest) -> Flow {
        info!(
            peer = %self.peer,
            channels = request.num_channels,
            blocks = request.num_blocks,
            shared = request.shared,
            numa = request.numa_id,
            remote = request.remote,
            "allocation request"
        );

        let (vssd, granted) = self.ctx.manager.alloc(request);
        if granted == 0 {
            warn!(peer = %self.peer, "request granted no channels");
        }

        if request.remote && granted > 0 {
            match materialize_session(&*self.ctx.backend, self.ctx.vblk_selftest, &vssd) {
                Ok(session) => {
                    info!(
                        peer = %self.peer,
                        vblks = session.vblks.len(),
                        vblk_nbytes = session.vblk_nbytes,
                        "remote session materialized"
                    );
                    self.session = Some(session);
                }
                Err(e) => {
                    error!(peer = %self.peer, "remote session setup failed: {e}");
                    return Flow::Close;
                }
            }
        }

        self.writeq.push_back(PendingWrite {
            buf: vssd.encode(),
            offset: 0,
        });

        self.ctx.manager.persist();
        self.ctx.manager.publish_resources();
        Flow::Continue
    }

    fn dispatch_read(&mut self, block_index: u32, count: u64, offset: u64) -> Flow {
        let peer = self.peer;
        let Some(session) = self.session.as_mut() else {
            warn!(%peer, "block i/o without a remote session");
            return Flow::Close;
        };
        if count > session.vblk_nbytes {
            warn!(%peer, count, limit = session.vblk_nbytes, "read larger than vblk");
            return Flow::Close;
        }
        let Some(vblk) = session.vblks.get_mut(block_index as usize) else {
            warn!(%peer, block_index, "read for unknown block");
            return Flow::Close;
        };

        let mut buf = vec![0u8; count as usize];
        match vblk.pread(&mut buf, offset) {
            Ok(n) => {
                // A short device read truncates the reply.
                buf.truncate(n);
                self.writeq.push_back(PendingWrite { buf, offset: 0 });
                Flow::Continue
            }
            Err(e) => {
                error!(%peer, block_index, "vblk read failed: {e}");
                Flow::Close
            }
        }
    }

    fn dispatch_write(&mut self, block_index: u32, count: u64) -> Flow {
        let peer = self.peer;
        let Some(session) = self.session.as_mut() else {
            warn!(%peer, "block i/o without a remote session");
            return Flow::Close;
        };
        if count > session.vblk_nbytes {
            warn!(%peer, count, limit = session.vblk_nbytes, "write larger than vblk");
            return Flow::Close;
        }
        if session.vblks.get(block_index as usize).is_none() {
            warn!(%peer, block_index, "write for unknown block");
            return Flow::Close;
        }

        if count == 0 {
            return Flow::Continue;
        }
        self.phase = Phase::WritePayload {
            block_index,
            buf: vec![0u8; count as usize],
            filled: 0,
        };
        Flow::Continue
    }

    fn finish_write(&mut self, block_index: u32, buf: &[u8]) -> Flow {
        let peer = self.peer;
        let Some(vblk) = self
            .session
            .as_mut()
            .and_then(|s| s.vblks.get_mut(block_index as usize))
        else {
            return Flow::Close;
        };
        if let Err(e) = vblk.write(buf) {
            // The session survives; later ops on this vblk may fail too.
            error!(%peer, block_index, "vblk write failed: {e}");
        }
        Flow::Continue
    }

    fn dispatch_erase(&mut self, block_index: u32) -> Flow {
        let peer = self.peer;
        let Some(vblk) = self
            .session
            .as_mut()
            .and_then(|s| s.vblks.get_mut(block_index as usize))
        else {
            warn!(%peer, block_index, "erase for unknown block");
            return Flow::Close;
        };
        if let Err(e) = vblk.erase() {
            error!(%peer, block_index, "vblk erase failed: {e}");
        }
        Flow::Continue
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!(peer = %self.peer, "connection dropped");
    }
}

/// Build the vblk table for a remote vSSD.
///
/// Only the first unit is proxied. Within each channel, vblks are built
/// block-by-block: each vblk aggregates the current block of every LUN that
/// still has blocks in its carved range, then each participating LUN's
/// cursor advances. The table order defines the wire-visible block indices.
pub(crate) fn materialize_session(
    backend: &dyn ocnvm::NvmBackend,
    selftest: bool,
    vssd: &Vssd,
) -> Result<RemoteSession, DeviceError> {
    let Some(vunit) = vssd.units.first() else {
        return Ok(RemoteSession {
            vblks: Vec::new(),
            vblk_nbytes: 0,
        });
    };
    if vssd.units.len() > 1 {
        warn!(
            vssd_id = vssd.id,
            units = vssd.units.len(),
            "remote proxy covers only the first unit"
        );
    }

    let device = backend.open(&vunit.dev_name)?;
    let nblocks = device.geometry().nblocks as u32;

    let mut vblks: Vec<Box<dyn Vblk>> = Vec::new();
    for vchannel in &vunit.channels {
        // (lun, next block, end of range) cursors.
        let mut cursors: Vec<(u32, u32, u32)> = if vchannel.shared {
            vchannel
                .luns
                .iter()
                .map(|l| (l.lun_id, l.block_start, l.block_start + l.num_blocks))
                .collect()
        } else {
            (0..vchannel.num_luns).map(|lun| (lun, 0, nblocks)).collect()
        };

        loop {
            let addrs: Vec<PhysAddr> = cursors
                .iter_mut()
                .filter(|(_, next, end)| next < end)
                .map(|(lun, next, _)| {
                    let addr = PhysAddr {
                        channel: vchannel.channel_id,
                        lun: *lun,
                        block: *next,
                    };
                    *next += 1;
                    addr
                })
                .collect();
            if addrs.is_empty() {
                break;
            }
            vblks.push(device.vblk_alloc(&addrs)?);
        }
    }

    if selftest {
        let before = vblks.len();
        vblks.retain_mut(|vblk| match selftest_vblk(vblk.as_mut()) {
            Ok(()) => true,
            Err(e) => {
                warn!("dropping vblk that failed self-test: {e}");
                false
            }
        });
        debug!(kept = vblks.len(), dropped = before - vblks.len(), "vblk self-test done");
    }

    let vblk_nbytes = vblks.first().map(|v| v.nbytes()).unwrap_or(0);
    Ok(RemoteSession { vblks, vblk_nbytes })
}

/// Erase, fill, and read back one vblk in fixed-size requests.
fn selftest_vblk(vblk: &mut dyn Vblk) -> Result<(), DeviceError> {
    const REQ_SIZE: u64 = 262_144;

    vblk.erase()?;

    let chunk = REQ_SIZE.min(vblk.nbytes()) as usize;
    if chunk == 0 {
        return Ok(());
    }
    let rounds = vblk.nbytes() as usize / chunk;

    let mut buf = vec![0u8; chunk];
    for _ in 0..rounds {
        vblk.write(&buf)?;
    }
    for i in 0..rounds {
        vblk.pread(&mut buf, (i * chunk) as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocnvm::{EmuBackend, Geometry, NvmBackend};
    use vssd::{VChannel, VLun, VUnit};

    fn test_geometry() -> Geometry {
        Geometry {
            nchannels: 8,
            nluns: 4,
            nplanes: 1,
            nblocks: 3,
            npages: 4,
            nsectors: 4,
            page_nbytes: 2048,
            sector_nbytes: 512,
            meta_nbytes: 0,
        }
    }

    fn remote_vssd(channels: Vec<VChannel>) -> Vssd {
        let mut unit = VUnit::new("/dev/nvme0n1", test_geometry());
        unit.channels = channels;
        Vssd {
            id: 0,
            units: vec![unit],
        }
    }

    #[test]
    fn shared_channel_materializes_block_by_block() {
        let backend = EmuBackend::new(test_geometry());
        let vssd = remote_vssd(vec![VChannel::shared(
            2,
            vec![
                VLun {
                    lun_id: 0,
                    block_start: 0,
                    num_blocks: 2,
                },
                VLun {
                    lun_id: 3,
                    block_start: 1,
                    num_blocks: 1,
                },
            ],
        )]);

        let session = materialize_session(&backend, false, &vssd).unwrap();
        let block_nbytes = test_geometry().block_nbytes();

        // First vblk spans both LUNs; the second only LUN 0's remainder.
        assert_eq!(session.vblks.len(), 2);
        assert_eq!(session.vblks[0].nbytes(), 2 * block_nbytes);
        assert_eq!(session.vblks[1].nbytes(), block_nbytes);
        assert_eq!(session.vblk_nbytes, 2 * block_nbytes);
    }

    #[test]
    fn materialized_vblks_hit_the_carved_addresses() {
        let backend = EmuBackend::new(test_geometry());
        let vssd = remote_vssd(vec![VChannel::shared(
            2,
            vec![
                VLun {
                    lun_id: 0,
                    block_start: 0,
                    num_blocks: 2,
                },
                VLun {
                    lun_id: 3,
                    block_start: 1,
                    num_blocks: 1,
                },
            ],
        )]);
        let mut session = materialize_session(&backend, false, &vssd).unwrap();

        // Fill the first vblk: bytes land in (2,0,0) then (2,3,1).
        let block_nbytes = test_geometry().block_nbytes() as usize;
        let mut data = vec![0xa5u8; block_nbytes];
        data.extend(vec![0x5au8; block_nbytes]);
        session.vblks[0].write(&data).unwrap();

        let device = backend.open("/dev/nvme0n1").unwrap();
        let mut probe = device
            .vblk_alloc(&[PhysAddr {
                channel: 2,
                lun: 3,
                block: 1,
            }])
            .unwrap();
        let mut buf = vec![0u8; block_nbytes];
        probe.pread(&mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn exclusive_channel_materializes_every_block() {
        let backend = EmuBackend::new(test_geometry());
        let geo = test_geometry();
        let vssd = remote_vssd(vec![VChannel::exclusive(
            5,
            (geo.nluns * geo.nblocks) as u32,
            geo.nluns as u32,
        )]);

        let session = materialize_session(&backend, false, &vssd).unwrap();
        // One vblk per block index, each spanning all four LUNs.
        assert_eq!(session.vblks.len(), geo.nblocks as usize);
        for vblk in &session.vblks {
            assert_eq!(vblk.nbytes(), geo.nluns * geo.block_nbytes());
        }
    }

    #[test]
    fn empty_grant_materializes_nothing() {
        let backend = EmuBackend::new(test_geometry());
        let vssd = Vssd::new();
        let session = materialize_session(&backend, false, &vssd).unwrap();
        assert!(session.vblks.is_empty());
        assert_eq!(session.vblk_nbytes, 0);
    }

    #[test]
    fn selftest_keeps_healthy_vblks() {
        let backend = EmuBackend::new(test_geometry());
        let vssd = remote_vssd(vec![VChannel::shared(
            0,
            vec![VLun {
                lun_id: 0,
                block_start: 0,
                num_blocks: 2,
            }],
        )]);
        let session = materialize_session(&backend, true, &vssd).unwrap();
        assert_eq!(session.vblks.len(), 2);
    }
}
