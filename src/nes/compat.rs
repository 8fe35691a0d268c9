use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::{fs, path::Path};

use super::mapper::Mirroring;

/// Board settings that replace header-derived values for a known image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatEntry {
    pub mapper: u16,
    pub submapper: u8,
    pub mirroring: Option<Mirroring>,
    pub battery: bool,
    pub prg_ram_size: Option<usize>,
    pub chr_ram_size: Option<usize>,
}

/// Compatibility database keyed by the uppercase SHA-1 of PRG+CHR.
///
/// Loaded from the NES 2.0 XML database layout:
/// `<game><rom sha1=".."/><pcb mapper=".." submapper=".." mirroring="V" battery="0"/>
/// <prgram size=".."/><chrram size=".."/></game>`.
#[derive(Debug, Clone, Default)]
pub struct CompatDb {
    entries: HashMap<String, CompatEntry>,
}

#[derive(Default)]
struct PendingGame {
    sha1: Option<String>,
    entry: Option<CompatEntry>,
    prg_ram: usize,
    chr_ram: Option<usize>,
    saw_prg_ram: bool,
}

impl CompatDb {
    pub fn from_file(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path)
            .with_context(|| format!("failed to read compatibility database: {}", path.display()))?;
        Self::from_xml_str(&xml)
    }

    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut db = Self::default();
        let mut game: Option<PendingGame> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) if e.name().as_ref() == b"game" => {
                    game = Some(PendingGame::default());
                }
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    if let Some(game) = game.as_mut() {
                        apply_element(game, &e, &reader)?;
                    }
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"game" => {
                    if let Some(game) = game.take() {
                        db.finish_game(game);
                    }
                }
                Ok(Event::Eof) => break,
                Err(err) => bail!(
                    "failed to parse compatibility database at byte {}: {err}",
                    reader.buffer_position()
                ),
                _ => {}
            }
        }

        log::debug!("compatibility database holds {} entries", db.len());
        Ok(db)
    }

    pub fn insert(&mut self, sha1: &str, entry: CompatEntry) {
        self.entries.insert(sha1.to_ascii_uppercase(), entry);
    }

    pub fn lookup(&self, sha1: &str) -> Option<&CompatEntry> {
        self.entries.get(&sha1.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish_game(&mut self, game: PendingGame) {
        let (Some(sha1), Some(mut entry)) = (game.sha1, game.entry) else {
            return;
        };
        if game.saw_prg_ram {
            entry.prg_ram_size = Some(game.prg_ram);
        }
        entry.chr_ram_size = game.chr_ram;
        self.insert(&sha1, entry);
    }
}

fn apply_element(game: &mut PendingGame, e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<()> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.context("malformed attribute in compatibility database")?;
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .context("undecodable attribute in compatibility database")?;
        attrs.insert(attr.key.as_ref().to_vec(), value.to_string());
    }
    let size = || -> usize {
        attrs
            .get(b"size".as_slice())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    match e.name().as_ref() {
        b"rom" => game.sha1 = attrs.get(b"sha1".as_slice()).cloned(),
        b"pcb" => {
            let mapper = attrs
                .get(b"mapper".as_slice())
                .and_then(|v| v.parse().ok())
                .context("pcb element without a numeric mapper")?;
            let submapper = attrs
                .get(b"submapper".as_slice())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mirroring = match attrs.get(b"mirroring".as_slice()).map(String::as_str) {
                Some("H") => Some(Mirroring::Horizontal),
                Some("V") => Some(Mirroring::Vertical),
                Some("4") => Some(Mirroring::FourScreen),
                _ => None,
            };
            let battery = attrs.get(b"battery".as_slice()).is_some_and(|v| v == "1");
            game.entry = Some(CompatEntry {
                mapper,
                submapper,
                mirroring,
                battery,
                prg_ram_size: None,
                chr_ram_size: None,
            });
        }
        b"prgram" | b"prgnvram" => {
            game.prg_ram += size();
            game.saw_prg_ram = true;
        }
        b"chrram" | b"chrnvram" => {
            game.chr_ram = Some(game.chr_ram.unwrap_or(0) + size());
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<nes20db>
  <game>
    <prgrom size="131072" crc32="00000000" sha1="1111"/>
    <rom size="262144" crc32="00000000" sha1="abcdef0123456789abcdef0123456789abcdef01"/>
    <pcb mapper="4" submapper="0" mirroring="4" battery="1"/>
    <prgnvram size="8192"/>
    <chrram size="8192"/>
  </game>
  <game>
    <rom size="40960" sha1="00000000000000000000000000000000000000AA"/>
    <pcb mapper="0" submapper="0" mirroring="V" battery="0"/>
  </game>
  <game>
    <rom size="40960" sha1="BB"/>
  </game>
</nes20db>"#;

    #[test]
    fn parses_games_keyed_by_rom_hash() {
        let db = CompatDb::from_xml_str(SAMPLE).unwrap();
        assert_eq!(db.len(), 2);

        let mmc3 = db
            .lookup("ABCDEF0123456789ABCDEF0123456789ABCDEF01")
            .unwrap();
        assert_eq!(mmc3.mapper, 4);
        assert_eq!(mmc3.mirroring, Some(Mirroring::FourScreen));
        assert!(mmc3.battery);
        assert_eq!(mmc3.prg_ram_size, Some(8192));
        assert_eq!(mmc3.chr_ram_size, Some(8192));

        let nrom = db
            .lookup("00000000000000000000000000000000000000aa")
            .unwrap();
        assert_eq!(nrom.mirroring, Some(Mirroring::Vertical));
        assert_eq!(nrom.prg_ram_size, None);
    }

    #[test]
    fn unknown_hash_falls_through() {
        let db = CompatDb::from_xml_str(SAMPLE).unwrap();
        assert!(db.lookup("FFFF").is_none());
        assert!(CompatDb::default().is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(CompatDb::from_xml_str("<nes20db><game><pcb mapper=\"x\"/></game>").is_err());
    }
}
