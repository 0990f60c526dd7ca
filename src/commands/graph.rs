use anyhow::Result;

use crate::pipeline::mermaid_diagram;

pub fn run() -> Result<()> {
    println!("{}", mermaid_diagram());
    Ok(())
}
