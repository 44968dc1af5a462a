use crate::error::{required, validate_identity, validate_term, Result, ServiceError};
use chrono::{DateTime, Utc};
use rollcall_store::{NewPerson, Person, Store};

/// Optional narrowing for [`PersonRegistry::list_persons`].
#[derive(Debug, Default, Clone)]
pub struct PersonFilter {
    pub department: Option<String>,
    /// Case-insensitive substring of name or roll number.
    pub query: Option<String>,
}

#[derive(Clone)]
pub struct PersonRegistry {
    store: Store,
}

impl PersonRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_person(&self, person: NewPerson) -> Result<Person> {
        self.create_person_at(person, Utc::now()).await
    }

    pub async fn create_person_at(&self, person: NewPerson, now: DateTime<Utc>) -> Result<Person> {
        let person_id = person.person_id.trim().to_string();
        validate_identity("person", &person_id)?;
        let person = NewPerson {
            person_id: person_id.clone(),
            name: required("name", &person.name)?,
            department: required("department", &person.department)?,
            term: validate_term(person.term)?,
            course: required("course", &person.course)?,
        };

        if !self.store.insert_person(person, now).await? {
            return Err(ServiceError::DuplicatePerson(person_id));
        }
        tracing::info!(person_id = %person_id, "person registered");
        self.get_person(&person_id).await
    }

    pub async fn get_person(&self, person_id: &str) -> Result<Person> {
        validate_identity("person", person_id)?;
        self.store
            .person(person_id)
            .await?
            .ok_or_else(|| ServiceError::PersonNotFound(person_id.to_string()))
    }

    pub async fn list_persons(&self, filter: PersonFilter) -> Result<Vec<Person>> {
        let nonblank = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(self
            .store
            .list_persons(nonblank(filter.department), nonblank(filter.query))
            .await?)
    }

    /// Delete each listed person with every embedding they own. Returns how
    /// many persons were actually removed.
    pub async fn delete_persons(&self, person_ids: &[String]) -> Result<u32> {
        if person_ids.is_empty() {
            return Err(ServiceError::InvalidInput("no person ids given".into()));
        }
        for id in person_ids {
            validate_identity("person", id)?;
        }

        let mut removed = 0;
        for id in person_ids {
            if self.store.delete_person(id).await? {
                removed += 1;
            }
        }
        tracing::info!(requested = person_ids.len(), removed, "persons deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, test_store};
    use rollcall_core::Embedding;
    use rollcall_store::EnrollmentStatus;

    fn new_person(id: &str, name: &str, department: &str) -> NewPerson {
        NewPerson {
            person_id: id.into(),
            name: name.into(),
            department: department.into(),
            term: 4,
            course: "BTech".into(),
        }
    }

    #[tokio::test]
    async fn test_create_starts_in_progress() {
        let registry = PersonRegistry::new(test_store().await);
        let p = registry
            .create_person_at(new_person(" 101 ", " Asha ", "CSE"), at(9, 0))
            .await
            .unwrap();
        assert_eq!(p.person_id, "101");
        assert_eq!(p.name, "Asha");
        assert_eq!(p.enrollment_status, EnrollmentStatus::InProgress);
        assert_eq!((p.enroll_failures, p.enrolled_images), (0, 0));
        assert_eq!(p.created_at, at(9, 0));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_fields() {
        let registry = PersonRegistry::new(test_store().await);
        registry.create_person_at(new_person("101", "Asha", "CSE"), at(9, 0)).await.unwrap();

        let err = registry
            .create_person_at(new_person("101", "Someone", "ECE"), at(9, 1))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "duplicate_person");
        assert_eq!(registry.get_person("101").await.unwrap().name, "Asha");

        let err = registry.create_person_at(new_person("102", "", "CSE"), at(9, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        let err = registry.create_person_at(new_person("1/2", "X", "CSE"), at(9, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
        let mut bad_term = new_person("103", "Y", "CSE");
        bad_term.term = 11;
        let err = registry.create_person_at(bad_term, at(9, 0)).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let registry = PersonRegistry::new(test_store().await);
        let err = registry.get_person("404").await.unwrap_err();
        assert_eq!(err.reason(), "person_not_found");
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let registry = PersonRegistry::new(test_store().await);
        registry.create_person_at(new_person("101", "Asha Rao", "CSE"), at(9, 0)).await.unwrap();
        registry.create_person_at(new_person("102", "Ravi", "CSE"), at(9, 0)).await.unwrap();
        registry.create_person_at(new_person("201", "Meera Rao", "ECE"), at(9, 0)).await.unwrap();

        let all = registry.list_persons(PersonFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let rao_cse = registry
            .list_persons(PersonFilter {
                department: Some("CSE".into()),
                query: Some("rao".into()),
            })
            .await
            .unwrap();
        assert_eq!(rao_cse.len(), 1);
        assert_eq!(rao_cse[0].person_id, "101");

        let blank = registry
            .list_persons(PersonFilter {
                department: Some("  ".into()),
                query: None,
            })
            .await
            .unwrap();
        assert_eq!(blank.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_counts() {
        let store = test_store().await;
        let registry = PersonRegistry::new(store.clone());
        registry.create_person_at(new_person("101", "Asha", "CSE"), at(9, 0)).await.unwrap();
        registry.create_person_at(new_person("102", "Ravi", "CSE"), at(9, 0)).await.unwrap();
        store.add_embedding("101", &Embedding::new(vec![1.0, 0.0, 0.0]), at(9, 1)).await.unwrap();

        let removed = registry
            .delete_persons(&["101".to_string(), "999".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.embeddings_for("101").await.unwrap().is_empty());
        assert!(registry.get_person("102").await.is_ok());

        let err = registry.delete_persons(&[]).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
    }
}
