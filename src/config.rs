//! Simulator configuration. A plain validating struct, built and checked the
//! same way as the rest of this codebase's config types — no external
//! config-file crate, since nothing here needs one for an in-process
//! simulation harness.

/// Recognized configuration options, with sensible defaults for a small
/// local run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Total participants.
    pub n: usize,
    /// log2 of committee count.
    pub s: u32,
    /// Committee size.
    pub c: usize,
    /// PoW difficulty, in leading hex zeros.
    pub d_difficulty: usize,
    /// Epoch-randomness bit length.
    pub r_bits: u32,
    /// Final-committee id.
    pub fin_num: u64,
    /// Number of epochs to run.
    pub epochs: u64,
    /// Transactions per epoch.
    pub txns_per_epoch: usize,
    /// Probability a participant is Byzantine, in [0.0, 1.0].
    pub faulty_fraction: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            n: 66,
            s: 2,
            c: 4,
            d_difficulty: 6,
            r_bits: 4,
            fin_num: 0,
            epochs: 2,
            txns_per_epoch: 20,
            faulty_fraction: 0.0,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }

    /// Number of committees, `2^s`.
    pub fn committee_count(&self) -> u64 {
        1u64 << self.s
    }

    /// Byzantine tolerance per committee, `f = floor((c-1)/3)`.
    pub fn f(&self) -> usize {
        (self.c.saturating_sub(1)) / 3
    }

    /// Validate that the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if self.n == 0 {
            return Err("n must be > 0".to_string());
        }
        if self.c == 0 {
            return Err("c must be > 0".to_string());
        }
        if self.committee_count() as usize * self.c > self.n {
            return Err(format!(
                "n={} is too small to populate {} committees of size {}",
                self.n,
                self.committee_count(),
                self.c
            ));
        }
        if self.fin_num >= self.committee_count() {
            return Err(format!(
                "fin_num={} must be < committee_count={}",
                self.fin_num,
                self.committee_count()
            ));
        }
        if !(0.0..=1.0).contains(&self.faulty_fraction) {
            return Err("faulty_fraction must be in [0.0, 1.0]".to_string());
        }
        Ok(())
    }
}

/// Builder for tests and callers who only want to override a few fields.
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    pub fn n(mut self, n: usize) -> Self {
        self.0.n = n;
        self
    }
    pub fn s(mut self, s: u32) -> Self {
        self.0.s = s;
        self
    }
    pub fn c(mut self, c: usize) -> Self {
        self.0.c = c;
        self
    }
    pub fn d_difficulty(mut self, d: usize) -> Self {
        self.0.d_difficulty = d;
        self
    }
    pub fn r_bits(mut self, r: u32) -> Self {
        self.0.r_bits = r;
        self
    }
    pub fn fin_num(mut self, fin_num: u64) -> Self {
        self.0.fin_num = fin_num;
        self
    }
    pub fn epochs(mut self, epochs: u64) -> Self {
        self.0.epochs = epochs;
        self
    }
    pub fn txns_per_epoch(mut self, txns_per_epoch: usize) -> Self {
        self.0.txns_per_epoch = txns_per_epoch;
        self
    }
    pub fn faulty_fraction(mut self, f: f64) -> Self {
        self.0.faulty_fraction = f;
        self
    }
    pub fn build(self) -> Result<Config, String> {
        self.0.validate()?;
        Ok(self.0)
    }
}
