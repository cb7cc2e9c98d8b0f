use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::directory::{DirectoryNumber, PersonDirectory, PersonRef};
use crate::error::SyncError;
use crate::numbers::NumberRule;

// Shorter numbers are extensions or feature codes, and would match half the directory.
const MIN_PARTIAL_LENGTH: usize = 5;

/// An internal phone, reachable by its full number or its short extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionMapEntry {
    pub number: String,
    pub extension: String,
    pub owner: PersonRef,
}

impl ExtensionMapEntry {
    pub fn from_directory(number: DirectoryNumber, extension_rule: &NumberRule) -> Self {
        Self {
            extension: extension_rule.apply(&number.number),
            number: number.number,
            owner: number.person,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolution {
    pub person: Option<PersonRef>,
    /// Whether the number is one of our own extensions.
    pub internal: bool,
}

impl Resolution {
    /// Internal, or nobody we know.
    pub fn is_internal_or_unknown(&self) -> bool {
        self.internal || self.person.is_none()
    }
}

/// Maps phone numbers to people for the duration of one sync run.
pub struct EndpointResolver {
    directory: Arc<dyn PersonDirectory>,
    extensions: Vec<ExtensionMapEntry>,
    memo: HashMap<String, Option<PersonRef>>,
}

impl EndpointResolver {
    pub fn new(directory: Arc<dyn PersonDirectory>, extensions: Vec<ExtensionMapEntry>) -> Self {
        Self {
            directory,
            extensions,
            memo: HashMap::new(),
        }
    }

    pub async fn resolve(&mut self, number: &str) -> Result<Resolution, SyncError> {
        if number.is_empty() {
            return Ok(Resolution::default());
        }

        if let Some(entry) = self
            .extensions
            .iter()
            .find(|e| e.number == number || e.extension == number)
        {
            return Ok(Resolution {
                person: Some(entry.owner),
                internal: true,
            });
        }

        if let Some(person) = self.memo.get(number) {
            return Ok(Resolution {
                person: *person,
                internal: false,
            });
        }

        let person = if number.chars().count() >= MIN_PARTIAL_LENGTH {
            self.directory.find_by_partial_number(number).await?
        } else {
            None
        };
        debug!(number, ?person, "resolved phone number");

        self.memo.insert(number.to_owned(), person);
        Ok(Resolution {
            person,
            internal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdr_common::store::StoreResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDirectory {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl PersonDirectory for CountingDirectory {
        async fn numbers_of_type(&self, _phone_type: &str) -> StoreResult<Vec<DirectoryNumber>> {
            Ok(Vec::new())
        }

        async fn find_by_partial_number(&self, partial: &str) -> StoreResult<Option<PersonRef>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok((partial == "6025550100").then_some(42))
        }

        async fn number_of_person(
            &self,
            _person: PersonRef,
            _phone_type: &str,
        ) -> StoreResult<Option<String>> {
            Ok(None)
        }
    }

    fn resolver(directory: Arc<CountingDirectory>) -> EndpointResolver {
        let extensions = vec![ExtensionMapEntry::from_directory(
            DirectoryNumber {
                number: "6025552345".to_owned(),
                person: 7,
            },
            &NumberRule::Right(4),
        )];
        EndpointResolver::new(directory, extensions)
    }

    #[tokio::test]
    async fn test_extension_matches_number_or_extension() {
        let directory = Arc::new(CountingDirectory::default());
        let mut resolver = resolver(directory.clone());

        let by_extension = resolver.resolve("2345").await.unwrap();
        let by_number = resolver.resolve("6025552345").await.unwrap();

        let expected = Resolution {
            person: Some(7),
            internal: true,
        };
        assert_eq!(by_extension, expected);
        assert_eq!(by_number, expected);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_lookup_is_memoized() {
        let directory = Arc::new(CountingDirectory::default());
        let mut resolver = resolver(directory.clone());

        for _ in 0..3 {
            let resolution = resolver.resolve("6025550100").await.unwrap();
            assert_eq!(resolution.person, Some(42));
            assert!(!resolution.internal);
        }
        for _ in 0..2 {
            assert_eq!(resolver.resolve("6025559999").await.unwrap().person, None);
        }

        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_short_and_empty_numbers_skip_directory() {
        let directory = Arc::new(CountingDirectory::default());
        let mut resolver = resolver(directory.clone());

        assert_eq!(resolver.resolve("").await.unwrap(), Resolution::default());
        assert_eq!(resolver.resolve("4444").await.unwrap(), Resolution::default());
        assert!(resolver.resolve("").await.unwrap().is_internal_or_unknown());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_short_number_is_measured_in_characters() {
        let directory = Arc::new(CountingDirectory::default());
        let mut resolver = resolver(directory.clone());

        // Four Arabic-Indic digits, eight bytes.
        let short = "\u{0660}\u{0661}\u{0662}\u{0663}";
        assert_eq!(short.len(), 8);

        assert_eq!(resolver.resolve(short).await.unwrap(), Resolution::default());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);

        resolver.resolve("\u{0660}\u{0661}\u{0662}\u{0663}\u{0664}").await.unwrap();
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
    }
}
