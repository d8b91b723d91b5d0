//! Real SEM adapter
//!
//! Maps the [`Microscope`] capability set onto vendor commands. The vendor runtime
//! itself sits behind [`VendorLink`]; this adapter adds only the connect-before-use
//! contract. Arguments are passed through unvalidated: out-of-range magnifications
//! or stage targets are the vendor's to accept or reject.
//!
//! Note: builds without a vendor binding use [`UnavailableVendorLink`], which fails at
//! `connect` so a misconfigured run aborts before touching any slot.

use async_trait::async_trait;
use image::GrayImage;

use crate::error::{AppResult, SemError};
use crate::hardware::{ConnectionGate, Microscope};
use crate::transform::StagePosition;

/// A command understood by the vendor runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorCommand {
    SetMagnification(f64),
    MoveStage(StagePosition),
    AutoFocus,
    AcquireImage,
    GetStagePosition,
}

/// What the vendor runtime answered.
#[derive(Debug, Clone)]
pub enum VendorReply {
    Done,
    Image(GrayImage),
    Position(StagePosition),
}

/// Session with the vendor runtime.
#[async_trait]
pub trait VendorLink: Send {
    /// Description for logs, e.g. the endpoint.
    fn describe(&self) -> String;

    /// Establish the session. Fails if the runtime cannot be reached.
    async fn open(&mut self) -> AppResult<()>;

    /// Execute one command, blocking until the instrument reports completion.
    async fn execute(&mut self, command: VendorCommand) -> AppResult<VendorReply>;
}

/// Placeholder link for builds with no vendor binding.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableVendorLink;

const UNAVAILABLE: &str =
    "SEM vendor runtime is not available in this build. Use --simulation to run against the virtual instrument";

#[async_trait]
impl VendorLink for UnavailableVendorLink {
    fn describe(&self) -> String {
        "unavailable".to_string()
    }

    async fn open(&mut self) -> AppResult<()> {
        Err(SemError::HardwareConnection(UNAVAILABLE.to_string()))
    }

    async fn execute(&mut self, _command: VendorCommand) -> AppResult<VendorReply> {
        Err(SemError::HardwareConnection(UNAVAILABLE.to_string()))
    }
}

/// SEM driven through the vendor runtime.
pub struct RealMicroscope {
    link: Box<dyn VendorLink>,
    gate: ConnectionGate,
}

impl RealMicroscope {
    pub fn new(link: Box<dyn VendorLink>) -> Self {
        Self {
            link,
            gate: ConnectionGate::default(),
        }
    }

    async fn passthrough(
        &mut self,
        operation: &'static str,
        command: VendorCommand,
    ) -> AppResult<VendorReply> {
        self.gate.check(operation)?;
        tracing::trace!(operation, ?command, "forwarding to vendor runtime");
        self.link.execute(command).await
    }
}

fn unexpected(operation: &'static str, reply: &VendorReply) -> SemError {
    SemError::operation(operation, format!("unexpected vendor reply {reply:?}"))
}

#[async_trait]
impl Microscope for RealMicroscope {
    fn name(&self) -> String {
        format!("SEM ({})", self.link.describe())
    }

    async fn connect(&mut self) -> AppResult<()> {
        tracing::info!(link = %self.link.describe(), "connecting to SEM");
        self.link.open().await.map_err(|err| match err {
            SemError::HardwareConnection(_) => err,
            other => SemError::HardwareConnection(other.to_string()),
        })?;
        self.gate.open();
        tracing::info!("SEM connected");
        Ok(())
    }

    async fn set_magnification(&mut self, magnification: f64) -> AppResult<()> {
        self.passthrough(
            "set_magnification",
            VendorCommand::SetMagnification(magnification),
        )
        .await
        .map(|_| ())
    }

    async fn move_stage(&mut self, position: StagePosition) -> AppResult<()> {
        self.passthrough("move_stage", VendorCommand::MoveStage(position))
            .await
            .map(|_| ())
    }

    async fn auto_focus(&mut self) -> AppResult<()> {
        self.passthrough("auto_focus", VendorCommand::AutoFocus)
            .await
            .map(|_| ())
    }

    async fn acquire_image(&mut self) -> AppResult<GrayImage> {
        match self
            .passthrough("acquire_image", VendorCommand::AcquireImage)
            .await?
        {
            VendorReply::Image(frame) => Ok(frame),
            other => Err(unexpected("acquire_image", &other)),
        }
    }

    async fn stage_position(&mut self) -> AppResult<StagePosition> {
        match self
            .passthrough("get_stage_position", VendorCommand::GetStagePosition)
            .await?
        {
            VendorReply::Position(position) => Ok(position),
            other => Err(unexpected("get_stage_position", &other)),
        }
    }
}
