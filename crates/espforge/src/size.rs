use espforge_core::{size::section_sizes, SizeReport};
use log::info;

use crate::Context;

pub fn size(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let sections = section_sizes(&ctx.elf)?;
    let report = SizeReport::new(&sections, &ctx.board);

    info!("Memory usage of {}", ctx.elf.display());
    info!("{}", report);
    report.warn_if_exceeded();

    Ok(())
}
