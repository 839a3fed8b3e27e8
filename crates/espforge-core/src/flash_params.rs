use crate::config::{BoardConfig, FlashSize};

/// SPI flash parameters embedded into converted images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashParams {
    pub mode: String,
    pub freq: String,
    pub size: FlashSize,
}

impl FlashParams {
    pub fn from_board(board: &BoardConfig) -> Self {
        Self {
            mode: image_flash_mode(board).to_string(),
            freq: image_frequency(board),
            size: board.flash_size(),
        }
    }
}

/// Images are always written in dio, the second stage bootloader switches to the quad modes.
pub fn image_flash_mode(board: &BoardConfig) -> &str {
    match board.build.flash_mode.as_str() {
        "qio" | "qout" => "dio",
        mode => mode,
    }
}

pub fn format_frequency(hz: u64) -> String {
    format!("{}m", hz / 1_000_000)
}

pub fn image_frequency(board: &BoardConfig) -> String {
    format_frequency(board.build.f_image.unwrap_or(board.build.f_flash))
}

pub fn boot_frequency(board: &BoardConfig) -> String {
    format_frequency(board.build.f_boot.unwrap_or(board.build.f_flash))
}

pub fn boot_mode(board: &BoardConfig) -> &str {
    if matches!(
        board.build.memory_type.as_deref(),
        Some("opi_opi") | Some("opi_qspi")
    ) {
        return "opi";
    }

    board
        .build
        .boot
        .as_deref()
        .filter(|boot| !boot.is_empty())
        .unwrap_or(&board.build.flash_mode)
}
