use bitflags::bitflags;
use serde::Serialize;

/// What is known about one aspect of a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityState {
    /// Not examined yet, or not applicable (the salt of a plain file).
    #[default]
    Unknown,
    Healthy,
    Corrupted,
}

impl IntegrityState {
    /// Combines two observations. Corruption is sticky and any real
    /// observation outranks `Unknown`.
    pub fn merge(self, other: IntegrityState) -> IntegrityState {
        use IntegrityState::*;
        match (self, other) {
            (Corrupted, _) | (_, Corrupted) => Corrupted,
            (Healthy, _) | (_, Healthy) => Healthy,
            (Unknown, Unknown) => Unknown,
        }
    }

    pub fn is_corrupted(self) -> bool {
        self == IntegrityState::Corrupted
    }
}

bitflags! {
    /// Packed "ok" bits for callers that want a single integer. A bit is
    /// set unless the matching aspect was observed to be corrupted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntegrityBits: u32 {
        const HEADER_OK = 1;
        const DATA_OK = 2;
        const KDF_SALT_OK = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub header: IntegrityState,
    pub data: IntegrityState,
    pub kdf_salt: IntegrityState,
}

impl IntegrityReport {
    pub fn observe_header(&mut self, state: IntegrityState) {
        self.header = self.header.merge(state);
    }

    pub fn observe_data(&mut self, state: IntegrityState) {
        self.data = self.data.merge(state);
    }

    pub fn observe_kdf_salt(&mut self, state: IntegrityState) {
        self.kdf_salt = self.kdf_salt.merge(state);
    }

    pub fn merge(&mut self, other: IntegrityReport) {
        self.observe_header(other.header);
        self.observe_data(other.data);
        self.observe_kdf_salt(other.kdf_salt);
    }

    pub fn bits(&self) -> IntegrityBits {
        let mut bits = IntegrityBits::empty();
        bits.set(IntegrityBits::HEADER_OK, !self.header.is_corrupted());
        bits.set(IntegrityBits::DATA_OK, !self.data.is_corrupted());
        bits.set(IntegrityBits::KDF_SALT_OK, !self.kdf_salt.is_corrupted());
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_sticky() {
        let mut report = IntegrityReport::default();
        report.observe_data(IntegrityState::Corrupted);
        report.observe_data(IntegrityState::Healthy);
        assert_eq!(report.data, IntegrityState::Corrupted);
    }

    #[test]
    fn healthy_replaces_unknown() {
        assert_eq!(
            IntegrityState::Unknown.merge(IntegrityState::Healthy),
            IntegrityState::Healthy
        );
    }

    #[test]
    fn bits_treat_unknown_as_ok() {
        let report = IntegrityReport {
            header: IntegrityState::Healthy,
            data: IntegrityState::Corrupted,
            kdf_salt: IntegrityState::Unknown,
        };
        assert_eq!(
            report.bits(),
            IntegrityBits::HEADER_OK | IntegrityBits::KDF_SALT_OK
        );
        assert_eq!(report.bits().bits(), 5);
    }
}
