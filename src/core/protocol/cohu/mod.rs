//! Multi-drop PTZ camera protocol
//!
//! Fire-and-forget: frames are never acknowledged, so the link's minimum
//! command spacing is the only flow control.

pub mod frame;
pub mod quantize;

pub use frame::{checksum, encode, verify_frame, Command, DropAddress, Frame};
pub use quantize::Motion;

use crate::core::comm::{
    CommError, DeviceUpdate, Step, StepContext, StepKind, StepOutcome,
};
use bytes::BytesMut;
use std::collections::VecDeque;

/// Minimum spacing between frames on a camera line (ms)
pub const DEFAULT_MIN_INTERVAL_MS: u64 = 20;

/// Step sending one camera frame
#[derive(Debug)]
pub struct CohuStep {
    drop: u16,
    command: Command,
    remaining: VecDeque<Command>,
}

impl CohuStep {
    /// Chain of commands sent one frame per step
    pub fn chain(drop: u16, commands: impl IntoIterator<Item = Command>) -> Option<Self> {
        let mut remaining: VecDeque<Command> = commands.into_iter().collect();
        let command = remaining.pop_front()?;
        Some(Self {
            drop,
            command,
            remaining,
        })
    }

    /// Single command
    pub fn single(drop: u16, command: Command) -> Self {
        Self {
            drop,
            command,
            remaining: VecDeque::new(),
        }
    }

    /// Pan, tilt and zoom as three chained frames
    pub fn ptz(drop: u16, pan: f32, tilt: f32, zoom: f32) -> Self {
        Self {
            drop,
            command: Command::pan(pan),
            remaining: VecDeque::from([Command::tilt(tilt), Command::zoom(zoom)]),
        }
    }

    /// Command this step sends
    pub fn command(&self) -> Command {
        self.command
    }
}

impl Step for CohuStep {
    fn kind(&self) -> StepKind {
        StepKind::Send
    }

    fn describe(&self) -> String {
        self.command.name().to_string()
    }

    fn poll(&mut self, ctx: &mut StepContext<'_>, tx: &mut BytesMut) -> Result<(), CommError> {
        let drop = DropAddress::new(self.drop)?;
        frame::encode(drop, &self.command, tx);
        match self.command {
            Command::RecallPreset(p) | Command::StorePreset(p) => {
                ctx.notify(DeviceUpdate::Preset(quantize::clamp_preset(u16::from(p))));
            }
            _ => {}
        }
        Ok(())
    }

    fn next(mut self) -> StepOutcome<Self> {
        match self.remaining.pop_front() {
            Some(command) => {
                self.command = command;
                StepOutcome::Advance(self)
            }
            None => StepOutcome::Done,
        }
    }
}
