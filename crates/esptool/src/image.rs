//! Program images: raw little endian dumps of the whole program memory.
use binrw::{BinRead, io::BufReader};
use espint::{PROGRAM_WORDS, Program};
use eyre_pretty::{Context, Result};
use std::path::Path;

#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct Image {
    #[br(count = PROGRAM_WORDS)]
    pub words: Vec<u32>,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("opening program image")?;
        let image = Self::read(&mut BufReader::new(file)).context("reading program image")?;

        Ok(image)
    }

    pub fn program(&self) -> Program {
        let mut program = Program::default();
        for (index, word) in self.words.iter().enumerate() {
            program.set_word(index, *word);
        }

        program
    }
}
