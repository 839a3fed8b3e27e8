use std::path::Path;

use espforge_core::{
    tool::ProcessRunner,
    upload::{PortScanner, UploadTarget},
    UploadDispatcher, UploadProtocol,
};
use log::info;

use crate::{build::layout, Context};

#[cfg(feature = "serial")]
fn scanner() -> impl PortScanner {
    espforge_core::upload::SerialPortScanner
}

#[cfg(not(feature = "serial"))]
fn scanner() -> impl PortScanner {
    use espforge_core::upload::{PortInfo, UploadError};

    struct NoSerialPorts;

    impl PortScanner for NoSerialPorts {
        fn available_ports(&self) -> Result<Vec<PortInfo>, UploadError> {
            Ok(Vec::new())
        }

        fn touch(&self, port: &str, _baud_rate: u32) -> Result<(), UploadError> {
            Err(UploadError::Serial(format!(
                "cannot touch {}, built without serial support",
                port
            )))
        }
    }

    NoSerialPorts
}

fn selected_protocol(ctx: &Context) -> Result<UploadProtocol, Box<dyn std::error::Error>> {
    let protocol =
        UploadProtocol::select(ctx.protocol_name(), ctx.upload_port.as_deref(), &ctx.board)?;
    info!("Upload protocol: {}", protocol.name());
    Ok(protocol)
}

pub fn upload(
    ctx: &Context,
    no_build: bool,
    erase: bool,
    filesystem: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Protocol errors surface before anything is built.
    let protocol = selected_protocol(ctx)?;

    let runner = ProcessRunner::new(true);
    let scanner = scanner();
    let dispatcher = UploadDispatcher::new(&ctx.board, &ctx.paths, &runner, &scanner)
        .with_abort_flag(&ctx.abort)
        .with_verbose(ctx.verbose);

    match filesystem {
        Some(image) => dispatcher.dispatch(protocol, UploadTarget::Filesystem(image))?,
        None => {
            let layout = layout(ctx, no_build)?;
            let target = if erase {
                UploadTarget::EraseAndFirmware(&layout)
            } else {
                UploadTarget::Firmware(&layout)
            };
            dispatcher.dispatch(protocol, target)?
        }
    }

    info!("Upload finished");
    Ok(())
}

pub fn erase(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let protocol = selected_protocol(ctx)?;

    let runner = ProcessRunner::new(true);
    let scanner = scanner();
    UploadDispatcher::new(&ctx.board, &ctx.paths, &runner, &scanner)
        .with_abort_flag(&ctx.abort)
        .with_verbose(ctx.verbose)
        .dispatch(protocol, UploadTarget::Erase)?;

    info!("Flash erased");
    Ok(())
}
