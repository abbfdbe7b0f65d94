//! Decode command handler

use anyhow::{bail, Result};

use cuesync_core::command;

use crate::output::Output;

/// Decode one frame given on the command line
pub fn decode(frame: &str, output: &Output) -> Result<()> {
    match command::decode_str(frame) {
        Ok(command) => {
            output.print_command(&command);
            Ok(())
        }
        Err(e) => bail!("Invalid frame: {}", e),
    }
}
