// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use stackfix::StackfixApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let app = StackfixApp::parse();
    let output = app.init_output();

    let mut stdout = std::io::stdout().lock();
    match app.exec(output, &mut stdout) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr(&output.stderr_styles());
            std::process::exit(error.process_exit_code())
        }
    }
}
