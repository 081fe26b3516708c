use fxhash::FxHashMap;

use super::config::Options;

/// Pack a board id and channel number into a single map key.
fn channel_uid(bid: i32, channel: usize) -> u64 {
    (bid as u64) * 1_000 + channel as u64
}

/// ChannelMap resolves a physical (board, channel) pair to the logical
/// channel number used in strax fragments.
///
/// The mapping comes from the options store and changes between detector
/// configurations, so nothing about it is hardcoded here. A physical channel
/// with no entry is a configuration bug: the formatter treats it as fatal
/// rather than guessing.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    map: FxHashMap<u64, i16>,
}

impl ChannelMap {
    pub fn from_options(options: &Options) -> Self {
        let mut map = FxHashMap::default();
        for (bid, channels) in options.channel_map.iter() {
            for (ch, logical) in channels.iter().enumerate() {
                map.insert(channel_uid(*bid, ch), *logical);
            }
        }
        ChannelMap { map }
    }

    /// The logical channel for a physical (board, channel) pair, None if
    /// the configuration does not know this channel.
    pub fn logical(&self, bid: i32, channel: usize) -> Option<i16> {
        self.map.get(&channel_uid(bid, channel)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_configured_channels() {
        let mut options = Options::default();
        options.channel_map.insert(110, vec![0, 1, 2, 3]);
        options.channel_map.insert(111, vec![8, 9, 10, 11]);
        let map = ChannelMap::from_options(&options);
        assert_eq!(map.logical(110, 0), Some(0));
        assert_eq!(map.logical(111, 3), Some(11));
        assert_eq!(map.logical(112, 0), None);
        assert_eq!(map.logical(110, 7), None);
    }
}
