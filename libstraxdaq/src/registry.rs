use fxhash::FxHashMap;
use std::sync::Arc;

use super::board_queue::BoardSlot;
use super::config::Options;
use super::digitizer::Digitizer;
use super::error::DigitizerError;
use super::registers::DataFormat;
use super::vme::VmeFactory;

/// The digitizers sharing one optical link, with their buffer slots.
///
/// A link group travels as a unit: the controller moves it into the link's
/// reader thread for the run and gets it back at stop.
pub struct LinkGroup {
    pub link: u8,
    pub digis: Vec<Digitizer>,
    pub slots: Vec<Arc<BoardSlot>>,
}

/// All boards owned by this host, grouped per optical link.
pub struct BoardRegistry {
    links: Vec<LinkGroup>,
    slots: FxHashMap<i32, Arc<BoardSlot>>,
    formats: FxHashMap<i32, DataFormat>,
}

impl BoardRegistry {
    /// Instantiate and reset every configured board. Any board that fails
    /// to initialize aborts the whole registry.
    pub fn build(
        options: &Options,
        factory: &VmeFactory,
    ) -> Result<Self, DigitizerError> {
        let mut registry = BoardRegistry {
            links: Vec::new(),
            slots: FxHashMap::default(),
            formats: FxHashMap::default(),
        };
        for spec in options.boards.iter() {
            spdlog::info!("Arming new digitizer {}", spec.bid);
            let vme = factory(spec).map_err(|_| DigitizerError::InitFailed(spec.bid))?;
            let digi = match Digitizer::init(vme, spec) {
                Ok(digi) => digi,
                Err(e) => {
                    spdlog::warn!("Failed to initialize digitizer {}", spec.bid);
                    return Err(e);
                }
            };
            let slot = Arc::new(BoardSlot::new(spec.bid));
            registry.slots.insert(spec.bid, slot.clone());
            registry.formats.insert(spec.bid, digi.data_format());
            match registry.links.iter_mut().find(|g| g.link == spec.link) {
                Some(group) => {
                    group.digis.push(digi);
                    group.slots.push(slot);
                }
                None => {
                    spdlog::info!("Defining a new optical link at {}", spec.link);
                    registry.links.push(LinkGroup {
                        link: spec.link,
                        digis: vec![digi],
                        slots: vec![slot],
                    });
                }
            }
        }
        spdlog::info!("This host has {} boards", registry.num_boards());
        Ok(registry)
    }

    pub fn num_boards(&self) -> usize {
        self.links.iter().map(|g| g.digis.len()).sum()
    }

    pub fn bids(&self) -> Vec<i32> {
        self.links
            .iter()
            .flat_map(|g| g.digis.iter().map(|d| d.bid()))
            .collect()
    }

    pub fn links_mut(&mut self) -> &mut [LinkGroup] {
        &mut self.links
    }

    /// Move the link groups out, e.g. into reader threads.
    pub fn take_links(&mut self) -> Vec<LinkGroup> {
        std::mem::take(&mut self.links)
    }

    /// Put link groups back after the reader threads are done with them.
    pub fn restore_links(&mut self, links: Vec<LinkGroup>) {
        self.links = links;
    }

    pub fn slot(&self, bid: i32) -> Option<Arc<BoardSlot>> {
        self.slots.get(&bid).cloned()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Arc<BoardSlot>> {
        self.slots.values()
    }

    pub fn data_format(&self, bid: i32) -> Option<DataFormat> {
        self.formats.get(&bid).copied()
    }

    /// Packets currently buffered across all boards.
    pub fn buffered_packets(&self) -> usize {
        self.slots.values().map(|s| s.len()).sum()
    }

    pub fn for_each_digi<F>(&mut self, mut f: F) -> Result<(), DigitizerError>
    where
        F: FnMut(&mut Digitizer) -> Result<(), DigitizerError>,
    {
        for group in self.links.iter_mut() {
            for digi in group.digis.iter_mut() {
                f(digi)?;
            }
        }
        Ok(())
    }
}
