//! Interactive operator prompt.

use anyhow::{anyhow, bail};
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Retrieve,
    Send,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub operation: Operation,
    pub filename: String,
}

/// Ask which operation to run and on which file.
pub fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> anyhow::Result<Request> {
    writeln!(output, "Select an option:")?;
    writeln!(output, "1. Retrieve a file")?;
    writeln!(output, "2. Send a file")?;
    output.flush()?;

    let operation = match read_line(input)?.as_str() {
        "1" => Operation::Retrieve,
        "2" => Operation::Send,
        other => bail!("Invalid option: {other:?}"),
    };

    let verb = match operation {
        Operation::Retrieve => "read",
        Operation::Send => "write",
    };
    writeln!(output, "Enter the filename to {verb}: ")?;
    output.flush()?;

    let filename = read_line(input)?;
    if filename.is_empty() {
        bail!("Empty filename");
    }
    Ok(Request {
        operation,
        filename,
    })
}

fn read_line<R: BufRead>(input: &mut R) -> anyhow::Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(anyhow!("Unexpected end of input"));
    }
    Ok(line.trim().to_string())
}
