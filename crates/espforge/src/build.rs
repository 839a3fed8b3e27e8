use std::{
    fs::{self, File},
    io::BufWriter,
    path::Path,
};

use espforge_core::{
    pipeline::BuildOutput,
    tool::{Esptool, GenEsp32Part, ProcessRunner},
    write_combined, FlashLayout, LinkedElf, Pipeline,
};
use log::{info, LevelFilter};

use crate::{reporter::ProgressBarReporter, Context};

fn with_pipeline<R>(ctx: &Context, f: impl FnOnce(&Pipeline<'_>) -> R) -> R {
    let runner = ProcessRunner::new(false);
    let paths = &ctx.paths;
    let converter = Esptool::new(&runner, paths.python(), &paths.esptool_script());
    let compiler = GenEsp32Part::new(&runner, paths.python(), &paths.partition_generator());

    f(&Pipeline::new(&ctx.board, paths, &converter, &compiler))
}

pub fn build(ctx: &Context) -> Result<BuildOutput, Box<dyn std::error::Error>> {
    let output = with_pipeline(ctx, |pipeline| pipeline.build(&LinkedElf::new(&ctx.elf)))?;

    info!(
        "Flash layout for {} ({} flash), partitions from {}:\n{}",
        output.layout.mcu(),
        output.layout.flash_size(),
        output.partitions_csv.display(),
        output.layout
    );
    Ok(output)
}

/// The layout to write: freshly built, or assembled from the previous build's outputs.
pub fn layout(ctx: &Context, no_build: bool) -> Result<FlashLayout, Box<dyn std::error::Error>> {
    if !no_build {
        return Ok(build(ctx)?.layout);
    }

    Ok(with_pipeline(ctx, |pipeline| pipeline.existing_layout())?)
}

pub fn merge(
    ctx: &Context,
    output: Option<&Path>,
    no_build: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let layout = layout(ctx, no_build)?;
    let output_path = match output {
        Some(path) => path.to_owned(),
        None => ctx.paths.factory_image(),
    };

    let writer = BufWriter::new(File::create(&output_path)?);
    let should_print_progress = log::max_level() >= LevelFilter::Info;

    let result = if should_print_progress {
        let mut reporter = ProgressBarReporter::new(layout.end(), "Merging ", writer);
        let result = write_combined(&layout, &mut reporter);
        reporter.finish(&format!("Wrote {}", output_path.display()));
        result
    } else {
        write_combined(&layout, writer)
    };

    if let Err(err) = result {
        fs::remove_file(&output_path)?;
        return Err(Box::new(err));
    }

    println!();
    info!("Flash {} at 0x0", output_path.display());
    Ok(())
}
