/*
 * Test utilities and fixtures for Sensorreg
 *
 * Builders for addresses, registries and scripted collaborators shared by
 * the unit test modules.
 */

#[cfg(test)]
pub mod test_utils {
    use std::collections::{HashMap, VecDeque};

    use crate::address::{dallas_crc8, slot_index, HardwareAddress, SensorId};
    use crate::input::{InputError, TextInput};
    use crate::registry::{CollisionPolicy, Registry, DEFAULT_MAX_NAME_LEN};
    use crate::store::MemoryStore;

    pub const TEST_CAPACITY: usize = 512;

    /// A DS18B20 address with a valid CRC, distinct for every `n`.
    pub fn sensor(n: u8) -> HardwareAddress {
        let mut bytes = [0x28, n, 0xA5, n ^ 0x5A, 0x01, 0x00, 0x00, 0x00];
        bytes[7] = dallas_crc8(&bytes[..7]);
        HardwareAddress::new(bytes)
    }

    /// Freshly formatted registry on a 512-byte in-memory store.
    pub fn memory_registry(policy: CollisionPolicy) -> Registry<MemoryStore> {
        Registry::open(MemoryStore::new(TEST_CAPACITY), policy, DEFAULT_MAX_NAME_LEN)
            .expect("open test registry")
    }

    /// Two distinct ids sharing a home slot in a table of `slot_count` slots.
    pub fn colliding_pair(slot_count: usize) -> (SensorId, SensorId) {
        let mut seen: HashMap<usize, SensorId> = HashMap::new();
        for n in 0..=u8::MAX {
            let id = sensor(n).to_sensor_id();
            let slot = slot_index(&id, slot_count);
            if let Some(first) = seen.get(&slot) {
                return (first.clone(), id);
            }
            seen.insert(slot, id);
        }
        panic!("no collision among 256 ids for {} slots", slot_count);
    }

    /// Text input that replays canned answers and records every prompt.
    #[derive(Debug, Default)]
    pub struct ScriptedInput {
        pub answers: VecDeque<Result<Option<String>, InputError>>,
        pub prompts: Vec<String>,
    }

    impl ScriptedInput {
        pub fn answering(lines: &[&str]) -> Self {
            Self {
                answers: lines.iter().map(|l| Ok(Some(l.to_string()))).collect(),
                prompts: Vec::new(),
            }
        }

        pub fn push(&mut self, answer: Result<Option<String>, InputError>) {
            self.answers.push_back(answer);
        }
    }

    impl TextInput for ScriptedInput {
        fn prompt_line(&mut self, message: &str) -> Result<Option<String>, InputError> {
            self.prompts.push(message.to_string());
            self.answers.pop_front().unwrap_or(Ok(None))
        }
    }

    #[test]
    fn test_sensor_addresses_are_valid_and_distinct() {
        assert!(sensor(0).crc_valid());
        assert!(sensor(200).crc_valid());
        assert_ne!(sensor(1), sensor(2));
    }

    #[test]
    fn test_colliding_pair_collides() {
        let (p, q) = colliding_pair(12);
        assert_ne!(p, q);
        assert_eq!(slot_index(&p, 12), slot_index(&q, 12));
    }
}
