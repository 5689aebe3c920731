use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use ffmpeg::{codec, codec::Parameters, encoder, format, format::context::Output, Packet, Rational};
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, warn};

enum Command {
    Open {
        path: PathBuf,
        parameters: Parameters,
        time_base: Rational,
        reply: oneshot::Sender<Result<()>>,
    },
    WriteHeader {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Rescale one packet from `time_base` and append it.
    WritePacket(Packet, Rational),
    /// Feed from a live packet subscription until detached or closed.
    Attach(Receiver<(Packet, Rational)>),
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Handle to one remuxer worker thread. All operations are queued onto the
/// worker, which owns the output format context; nothing here ever decodes
/// or re-encodes, packets are only timestamp-rescaled and copied.
pub struct Remuxer {
    id: usize,
    commands: Sender<Command>,
}

impl Remuxer {
    /// Creates the handle plus the worker to run on a dedicated thread.
    pub fn new(id: usize) -> (Remuxer, RemuxerWorker) {
        let (commands, mailbox) = unbounded();
        (
            Remuxer { id, commands },
            RemuxerWorker {
                id,
                mailbox,
                output: None,
                packets: None,
            },
        )
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Creates the output file with codec parameters copied bit-exact from
    /// the input stream.
    pub fn open_output(
        &self,
        path: PathBuf,
        parameters: Parameters,
        time_base: Rational,
    ) -> Result<()> {
        self.call(|reply| Command::Open {
            path,
            parameters,
            time_base,
            reply,
        })
    }

    pub fn write_header(&self) -> Result<()> {
        self.call(|reply| Command::WriteHeader { reply })
    }

    pub fn write_packet(&self, packet: Packet, time_base: Rational) {
        let _ = self.commands.send(Command::WritePacket(packet, time_base));
    }

    pub fn attach(&self, packets: Receiver<(Packet, Rational)>) {
        let _ = self.commands.send(Command::Attach(packets));
    }

    /// Writes the trailer and releases the file.
    pub fn close(&self) -> Result<()> {
        self.call(|reply| Command::Close { reply })
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn call(&self, command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .map_err(|_| anyhow!("remuxer {} worker is gone", self.id))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| anyhow!("remuxer {} dropped the reply", self.id))?
    }
}

struct OpenOutput {
    octx: Output,
    out_time_base: Rational,
    header_written: bool,
}

/// Thread-confined state of one remuxer.
pub struct RemuxerWorker {
    id: usize,
    mailbox: Receiver<Command>,
    output: Option<OpenOutput>,
    packets: Option<Receiver<(Packet, Rational)>>,
}

impl RemuxerWorker {
    /// Thread body; returns when the handle shuts the worker down.
    pub fn run(mut self) {
        let span = info_span!("remuxer", id = self.id);
        let _guard = span.enter();
        loop {
            let mailbox = self.mailbox.clone();
            let command = if let Some(packets) = self.packets.clone() {
                crossbeam::select! {
                    recv(mailbox) -> command => match command {
                        Ok(command) => Some(command),
                        Err(_) => break,
                    },
                    recv(packets) -> packet => {
                        match packet {
                            Ok((packet, time_base)) => {
                                if let Err(e) = self.write(&packet, time_base) {
                                    warn!(error = %e, "dropping packet");
                                }
                            }
                            Err(_) => self.packets = None,
                        }
                        None
                    }
                }
            } else {
                match mailbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            let Some(command) = command else { continue };
            match command {
                Command::Open {
                    path,
                    parameters,
                    time_base,
                    reply,
                } => {
                    let _ = reply.send(self.open(path, parameters, time_base));
                }
                Command::WriteHeader { reply } => {
                    let _ = reply.send(self.write_header());
                }
                Command::WritePacket(packet, time_base) => {
                    if let Err(e) = self.write(&packet, time_base) {
                        warn!(error = %e, "dropping packet");
                    }
                }
                Command::Attach(packets) => self.packets = Some(packets),
                Command::Close { reply } => {
                    let _ = reply.send(self.close());
                }
                Command::Shutdown => break,
            }
        }
        if let Err(e) = self.close() {
            error!(error = %e, "close on shutdown failed");
        }
        debug!("remuxer worker exited");
    }

    fn open(&mut self, path: PathBuf, parameters: Parameters, time_base: Rational) -> Result<()> {
        if self.output.is_some() {
            self.close()?;
        }
        let mut octx = format::output(&path)
            .with_context(|| format!("failed to open output {}", path.display()))?;
        {
            let mut ost = octx.add_stream(encoder::find(codec::Id::None))?;
            ost.set_parameters(parameters);
            // Codec tags rarely survive the container switch.
            unsafe {
                (*ost.parameters().as_mut_ptr()).codec_tag = 0;
            }
        }
        self.output = Some(OpenOutput {
            octx,
            out_time_base: time_base,
            header_written: false,
        });
        debug!(path = %path.display(), "output opened");
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| anyhow!("no output open"))?;
        if output.header_written {
            return Ok(());
        }
        output.octx.write_header()?;
        // The muxer may have re-based the stream while writing the header.
        if let Some(stream) = output.octx.stream(0) {
            output.out_time_base = stream.time_base();
        }
        output.header_written = true;
        Ok(())
    }

    fn write(&mut self, packet: &Packet, in_time_base: Rational) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| anyhow!("no output open"))?;
        if !output.header_written {
            return Err(anyhow!("header not written"));
        }
        let mut packet = packet.clone();
        packet.rescale_ts(in_time_base, output.out_time_base);
        packet.set_stream(0);
        packet.set_position(-1);
        packet.write_interleaved(&mut output.octx)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.packets = None;
        let Some(mut output) = self.output.take() else {
            return Ok(());
        };
        if output.header_written {
            output.octx.write_trailer()?;
        }
        Ok(())
    }
}
