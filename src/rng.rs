use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Stream id of the control stream, kept clear of any lane id.
const CONTROL_STREAM: u64 = u64::MAX;

/// A fixed set of independent random streams.
///
/// Every lane owns one stream and is handed out by exclusive reference, so
/// lanes never share generator state. All streams derive from one seed and
/// differ only in their ChaCha stream id, which makes the draws of a lane
/// depend on nothing but the seed and the lane index.
///
/// The control stream drives the acceptance decisions of the chain and does
/// not depend on the number of lanes.
#[derive(Debug, Clone)]
pub struct RngPool {
    lanes: Vec<ChaCha8Rng>,
    control: ChaCha8Rng,
}

impl RngPool {
    pub fn new(seed: u64, num_lanes: usize) -> Self {
        let lanes = (0..num_lanes.max(1))
            .map(|lane| stream(seed, lane as u64))
            .collect();
        RngPool {
            lanes,
            control: stream(seed, CONTROL_STREAM),
        }
    }

    pub fn num_lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane(&mut self, lane: usize) -> &mut ChaCha8Rng {
        &mut self.lanes[lane]
    }

    pub fn lanes_mut(&mut self) -> &mut [ChaCha8Rng] {
        &mut self.lanes
    }

    pub fn control(&mut self) -> &mut ChaCha8Rng {
        &mut self.control
    }
}

fn stream(seed: u64, id: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(id);
    rng
}
