use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

impl Args {
    pub fn open(&self) -> Result<Output, Error> {
        let io: Box<dyn std::io::Write> = match &self.output {
            None => Box::new(std::io::stdout().lock()),
            Some(path) => Box::new(
                std::fs::File::create(path).map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ),
        };
        let sink = match self.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Sink::Table(table)
            }
            Format::Jsonl => Sink::Jsonl,
            Format::Csv => Sink::Csv,
        };
        Ok(Output { path: self.output.clone(), io, sink })
    }
}

enum Sink {
    Table(comfy_table::Table),
    Jsonl,
    Csv,
}

/// Tabular output of records in the format the user asked for.
///
/// Tables are rendered once all rows are known, in [`Output::finish`]. The other formats are
/// streamed.
pub struct Output {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    sink: Sink,
}

impl Output {
    /// Column names. JSON lines carry field names in every record and skip this.
    pub fn header(&mut self, columns: &[&str]) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.set_header(columns.to_vec());
                Ok(())
            }
            Sink::Csv => self.write(&csv_record(columns)),
            Sink::Jsonl => Ok(()),
        }
    }

    pub fn record<R: serde::Serialize>(
        &mut self,
        cells: Vec<String>,
        record: &R,
    ) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Table(table) => {
                table.add_row(cells);
                Ok(())
            }
            Sink::Csv => self.write(&csv_record(&cells)),
            Sink::Jsonl => {
                let mut line = serde_json::to_vec(record).map_err(Error::SerializeJson)?;
                line.push(b'\n');
                self.write(&line)
            }
        }
    }

    pub fn finish(mut self) -> Result<(), Error> {
        if let Sink::Table(table) = &self.sink {
            let rendered = format!("{table}\n");
            self.write(rendered.as_bytes())?;
        }
        self.io.flush().map_err(|e| self.io_error(e))
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.io.write_all(bytes).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(path) => Error::WriteFile(e, path.clone()),
        }
    }
}

fn csv_record<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let mut writer = csv_core::Writer::new();
    let mut record = Vec::new();
    let mut buffer = [0; 64];
    for (i, field) in fields.iter().enumerate() {
        if i != 0 {
            let (_, written) = writer.delimiter(&mut buffer);
            record.extend_from_slice(&buffer[..written]);
        }
        let mut input = field.as_ref().as_bytes();
        loop {
            let (result, read, written) = writer.field(input, &mut buffer);
            record.extend_from_slice(&buffer[..written]);
            input = &input[read..];
            if let WriteResult::InputEmpty = result {
                break;
            }
        }
    }
    loop {
        let (result, written) = writer.terminator(&mut buffer);
        record.extend_from_slice(&buffer[..written]);
        if let WriteResult::InputEmpty = result {
            break record;
        }
    }
}
