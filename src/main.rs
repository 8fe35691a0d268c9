use std::path::PathBuf;

use dotclock::{app, logger};

fn main() -> anyhow::Result<()> {
    logger::init();
    let rom = std::env::args_os().nth(1).map(PathBuf::from);

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1024.0, 720.0])
            .with_min_inner_size([640.0, 480.0])
            .with_title("dotclock"),
        vsync: true,
        ..Default::default()
    };

    eframe::run_native(
        "dotclock",
        options,
        Box::new(|cc| Ok(Box::new(app::NesApp::new(cc, rom)))),
    )
    .map_err(|err| anyhow::anyhow!("failed to run app: {err}"))
}
