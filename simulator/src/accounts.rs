//! Simulated account holders.

use pocketbank_common::AccountId;

/// Creates account ids for a simulation run.
pub struct AccountFactory;

impl AccountFactory {
    /// Create `count` account ids under a run prefix.
    pub fn create_accounts(prefix: &str, count: usize) -> Vec<AccountId> {
        let holder_names = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
        ];

        (0..count)
            .map(|i| {
                let name = match holder_names.get(i) {
                    Some(name) => name.to_string(),
                    // Generate names beyond the predefined list
                    None => format!("holder{}", i + 1),
                };
                AccountId::new(format!("{}-{}", prefix, name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_accounts() {
        let accounts = AccountFactory::create_accounts("run1", 12);
        assert_eq!(accounts.len(), 12);
        assert_eq!(accounts[0].as_str(), "run1-alice");
        assert_eq!(accounts[11].as_str(), "run1-holder12");
        assert!(accounts.iter().all(AccountId::is_valid));
    }
}
