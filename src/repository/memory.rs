use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::{CommitOutcome, Mutation, Repository, RepositoryError};

/// Process-local store. Also the materialized state behind [`super::WalRepository`].
pub struct InMemoryRepository {
    providers: DashMap<Ulid, Provider>,
    /// Unique-name index: provider name → provider id.
    provider_names: DashMap<String, Ulid>,
    appointments: DashMap<Ulid, Appointment>,
    /// Client → appointment ids. Clients holding nothing have no entry.
    by_client: DashMap<Ulid, Vec<Ulid>>,
    /// Held across validate + apply for writes made through this adapter directly.
    writes: Mutex<()>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            provider_names: DashMap::new(),
            appointments: DashMap::new(),
            by_client: DashMap::new(),
            writes: Mutex::new(()),
        }
    }

    /// Rebuild state from a replayed event stream.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let repo = Self::new();
        for event in events {
            repo.apply(event);
        }
        repo
    }

    pub(super) fn provider(&self, id: &Ulid) -> Option<Provider> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn count_for(&self, client_id: &Ulid) -> u32 {
        self.by_client
            .get(client_id)
            .map_or(0, |ids| ids.len() as u32)
    }

    pub(super) fn appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    fn matching(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let mut found: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|a| a.id);
        found
    }

    // ── Validation ───────────────────────────────────────────

    /// Check `mutation` against current state and return the event that carries it
    /// out, or the outcome explaining why nothing may be written. Only meaningful
    /// while the caller keeps every other write out until the event is applied.
    pub(super) fn validate(&self, mutation: &Mutation) -> Result<Event, CommitOutcome> {
        match mutation {
            Mutation::SaveProvider(provider) => {
                if let Some(owner) = self.provider_names.get(&provider.name)
                    && *owner != provider.id
                {
                    return Err(CommitOutcome::NameTaken(provider.name.clone()));
                }
                Ok(Event::provider_saved(provider))
            }
            Mutation::DeleteProvider(id) => {
                if !self.providers.contains_key(id) {
                    return Err(CommitOutcome::ProviderMissing(*id));
                }
                if self.appointments.iter().any(|a| a.provider_id == *id) {
                    return Err(CommitOutcome::ProviderInUse(*id));
                }
                Ok(Event::ProviderDeleted { id: *id })
            }
            Mutation::Book {
                appointment,
                max_confirmed,
            } => {
                if !self.providers.contains_key(&appointment.provider_id) {
                    return Err(CommitOutcome::ProviderMissing(appointment.provider_id));
                }
                let current = self.count_for(&appointment.client_id);
                if let Some(max) = max_confirmed
                    && current >= *max
                {
                    return Err(CommitOutcome::QuotaExceeded { current });
                }
                Ok(Event::appointment_booked(appointment))
            }
            Mutation::Reschedule {
                id,
                provider_id,
                scheduled_at,
            } => {
                if !self.appointments.contains_key(id) {
                    return Err(CommitOutcome::AppointmentMissing(*id));
                }
                if !self.providers.contains_key(provider_id) {
                    return Err(CommitOutcome::ProviderMissing(*provider_id));
                }
                Ok(Event::AppointmentRescheduled {
                    id: *id,
                    provider_id: *provider_id,
                    scheduled_at: *scheduled_at,
                })
            }
            Mutation::Cancel(id) => {
                if !self.appointments.contains_key(id) {
                    return Err(CommitOutcome::AppointmentMissing(*id));
                }
                Ok(Event::AppointmentCancelled { id: *id })
            }
        }
    }

    fn commit(&self, mutation: Mutation) -> CommitOutcome {
        let _serial = self.writes.lock().unwrap_or_else(PoisonError::into_inner);
        match self.validate(&mutation) {
            Ok(event) => {
                self.apply(&event);
                CommitOutcome::Committed
            }
            Err(refused) => refused,
        }
    }

    // ── Event application ────────────────────────────────────

    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::ProviderSaved {
                id,
                name,
                years_of_experience,
                specialty,
                availability,
            } => {
                let old_name = self.providers.get(id).map(|p| p.name.clone());
                if let Some(old) = old_name
                    && old != *name
                {
                    self.provider_names.remove_if(&old, |_, owner| owner == id);
                }
                self.provider_names.insert(name.clone(), *id);
                self.providers.insert(
                    *id,
                    Provider {
                        id: *id,
                        name: name.clone(),
                        years_of_experience: *years_of_experience,
                        specialty: specialty.clone(),
                        availability: availability.clone(),
                    },
                );
            }
            Event::ProviderDeleted { id } => {
                if let Some((_, removed)) = self.providers.remove(id) {
                    self.provider_names
                        .remove_if(&removed.name, |_, owner| owner == id);
                }
            }
            Event::AppointmentBooked {
                id,
                client_id,
                provider_id,
                scheduled_at,
                created_at,
            } => {
                self.by_client.entry(*client_id).or_default().push(*id);
                self.appointments.insert(
                    *id,
                    Appointment {
                        id: *id,
                        client_id: *client_id,
                        provider_id: *provider_id,
                        scheduled_at: *scheduled_at,
                        created_at: *created_at,
                    },
                );
            }
            Event::AppointmentRescheduled {
                id,
                provider_id,
                scheduled_at,
            } => {
                if let Some(mut appt) = self.appointments.get_mut(id) {
                    appt.provider_id = *provider_id;
                    appt.scheduled_at = *scheduled_at;
                }
            }
            Event::AppointmentCancelled { id } => {
                let Some((_, removed)) = self.appointments.remove(id) else {
                    return;
                };
                if let Some(mut owned) = self.by_client.get_mut(&removed.client_id) {
                    owned.retain(|a| a != id);
                }
                self.by_client
                    .remove_if(&removed.client_id, |_, owned| owned.is_empty());
            }
        }
    }

    /// Minimal event stream that recreates the current state.
    pub(super) fn snapshot(&self) -> Vec<Event> {
        let mut providers: Vec<Provider> = self.providers.iter().map(|e| e.value().clone()).collect();
        providers.sort_by_key(|p| p.id);
        let appointments = self.matching(&AppointmentFilter::default());

        providers
            .iter()
            .map(Event::provider_saved)
            .chain(appointments.iter().map(Event::appointment_booked))
            .collect()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_provider(&self, id: Ulid) -> Result<Option<Provider>, RepositoryError> {
        Ok(self.provider(&id))
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, RepositoryError> {
        let mut providers: Vec<Provider> = self.providers.iter().map(|e| e.value().clone()).collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(providers)
    }

    async fn save_provider(&self, provider: Provider) -> Result<CommitOutcome, RepositoryError> {
        Ok(self.commit(Mutation::SaveProvider(provider)))
    }

    async fn delete_provider(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError> {
        Ok(self.commit(Mutation::DeleteProvider(id)))
    }

    async fn count_confirmed(&self, client_id: Ulid) -> Result<u32, RepositoryError> {
        Ok(self.count_for(&client_id))
    }

    async fn insert_appointment(
        &self,
        appointment: Appointment,
        max_confirmed: Option<u32>,
    ) -> Result<CommitOutcome, RepositoryError> {
        Ok(self.commit(Mutation::Book {
            appointment,
            max_confirmed,
        }))
    }

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, RepositoryError> {
        Ok(self.appointment(&id))
    }

    async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, RepositoryError> {
        Ok(self.matching(filter))
    }

    async fn replace_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<CommitOutcome, RepositoryError> {
        Ok(self.commit(Mutation::reschedule(&appointment)))
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError> {
        Ok(self.commit(Mutation::Cancel(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn ts(h: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 1, 3)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn provider(name: &str) -> Provider {
        Provider {
            id: Ulid::new(),
            name: name.into(),
            years_of_experience: 5,
            specialty: "General".into(),
            availability: vec![AvailabilityWindow::new(3, 9, 17)],
        }
    }

    fn appointment(client_id: Ulid, provider_id: Ulid) -> Appointment {
        Appointment {
            id: Ulid::new(),
            client_id,
            provider_id,
            scheduled_at: ts(10),
            created_at: ts(8),
        }
    }

    async fn with_provider(name: &str) -> (InMemoryRepository, Provider) {
        let repo = InMemoryRepository::new();
        let p = provider(name);
        assert_eq!(repo.save_provider(p.clone()).await.unwrap(), CommitOutcome::Committed);
        (repo, p)
    }

    #[tokio::test]
    async fn guarded_insert_stops_at_limit() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let client = Ulid::new();

        for _ in 0..2 {
            let outcome = repo.insert_appointment(appointment(client, p.id), Some(2)).await.unwrap();
            assert_eq!(outcome, CommitOutcome::Committed);
        }
        let outcome = repo.insert_appointment(appointment(client, p.id), Some(2)).await.unwrap();
        assert_eq!(outcome, CommitOutcome::QuotaExceeded { current: 2 });
        assert_eq!(repo.count_confirmed(client).await.unwrap(), 2);

        // Unguarded insert ignores the count.
        let outcome = repo.insert_appointment(appointment(client, p.id), None).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(repo.count_confirmed(client).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_frees_quota() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let client = Ulid::new();
        let appt = appointment(client, p.id);
        let id = appt.id;
        repo.insert_appointment(appt, Some(1)).await.unwrap();

        assert_eq!(repo.delete_appointment(id).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(
            repo.delete_appointment(id).await.unwrap(),
            CommitOutcome::AppointmentMissing(id)
        );
        assert_eq!(repo.count_confirmed(client).await.unwrap(), 0);
        let outcome = repo
            .insert_appointment(appointment(client, p.id), Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
    }

    #[tokio::test]
    async fn emptied_clients_leave_no_index_entry() {
        let (repo, p) = with_provider("Dr. Lund").await;
        for _ in 0..100 {
            let appt = appointment(Ulid::new(), p.id);
            let id = appt.id;
            repo.insert_appointment(appt, Some(3)).await.unwrap();
            repo.delete_appointment(id).await.unwrap();
        }
        assert!(repo.by_client.is_empty());
        assert!(repo.appointments.is_empty());
    }

    #[tokio::test]
    async fn booking_needs_a_live_provider() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let ghost = Ulid::new();

        let outcome = repo
            .insert_appointment(appointment(Ulid::new(), ghost), None)
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::ProviderMissing(ghost));

        let appt = appointment(Ulid::new(), p.id);
        repo.insert_appointment(appt.clone(), None).await.unwrap();
        let mut moved = appt.clone();
        moved.provider_id = ghost;
        assert_eq!(
            repo.replace_appointment(moved).await.unwrap(),
            CommitOutcome::ProviderMissing(ghost)
        );
        assert_eq!(repo.find_appointment(appt.id).await.unwrap(), Some(appt));
    }

    #[tokio::test]
    async fn referenced_provider_is_not_deleted() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let appt = appointment(Ulid::new(), p.id);
        repo.insert_appointment(appt.clone(), None).await.unwrap();

        assert_eq!(
            repo.delete_provider(p.id).await.unwrap(),
            CommitOutcome::ProviderInUse(p.id)
        );
        repo.delete_appointment(appt.id).await.unwrap();
        assert_eq!(repo.delete_provider(p.id).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(
            repo.delete_provider(p.id).await.unwrap(),
            CommitOutcome::ProviderMissing(p.id)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_delete_leaves_no_orphans() {
        for _ in 0..20 {
            let (repo, p) = with_provider("Dr. Lund").await;
            let repo = Arc::new(repo);
            let pid = p.id;

            let mut handles = Vec::new();
            for _ in 0..8 {
                let repo = repo.clone();
                handles.push(tokio::spawn(async move {
                    repo.insert_appointment(appointment(Ulid::new(), pid), None).await
                }));
            }
            let deleter = {
                let repo = repo.clone();
                tokio::spawn(async move { repo.delete_provider(pid).await })
            };
            for h in handles {
                h.await.unwrap().unwrap();
            }
            let deleted = deleter.await.unwrap().unwrap() == CommitOutcome::Committed;

            let referencing = repo
                .list_appointments(&AppointmentFilter {
                    client_id: None,
                    provider_id: Some(p.id),
                })
                .await
                .unwrap();
            if deleted {
                assert!(referencing.is_empty());
                assert_eq!(repo.find_provider(p.id).await.unwrap(), None);
            } else {
                assert!(!referencing.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let (repo, _) = with_provider("Dr. Kim").await;
        assert_eq!(
            repo.save_provider(provider("Dr. Kim")).await.unwrap(),
            CommitOutcome::NameTaken("Dr. Kim".into())
        );
    }

    #[tokio::test]
    async fn rename_releases_old_name() {
        let (repo, mut p) = with_provider("Dr. Kim").await;

        p.name = "Dr. Kim-Park".into();
        repo.save_provider(p.clone()).await.unwrap();

        // Old name is free again, new one is taken.
        assert_eq!(
            repo.save_provider(provider("Dr. Kim")).await.unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            repo.save_provider(provider("Dr. Kim-Park")).await.unwrap(),
            CommitOutcome::NameTaken("Dr. Kim-Park".into())
        );
        assert_eq!(repo.find_provider(p.id).await.unwrap().unwrap().name, "Dr. Kim-Park");
    }

    #[tokio::test]
    async fn delete_provider_releases_name() {
        let (repo, p) = with_provider("Dr. Ortiz").await;
        assert_eq!(repo.delete_provider(p.id).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(
            repo.save_provider(provider("Dr. Ortiz")).await.unwrap(),
            CommitOutcome::Committed
        );
    }

    #[tokio::test]
    async fn list_is_sorted_and_filtered() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let client = Ulid::new();
        let other = Ulid::new();
        let mut mine = Vec::new();
        for _ in 0..5 {
            let a = appointment(client, p.id);
            mine.push(a.id);
            repo.insert_appointment(a, None).await.unwrap();
            repo.insert_appointment(appointment(other, p.id), None).await.unwrap();
        }

        let filter = AppointmentFilter {
            client_id: Some(client),
            provider_id: None,
        };
        let listed: Vec<Ulid> = repo
            .list_appointments(&filter)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        mine.sort();
        assert_eq!(listed, mine);

        let all = repo.list_appointments(&AppointmentFilter::default()).await.unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn replace_keeps_identity() {
        let (repo, p) = with_provider("Dr. Lund").await;
        let target = provider("Dr. Quist");
        repo.save_provider(target.clone()).await.unwrap();
        let appt = appointment(Ulid::new(), p.id);
        repo.insert_appointment(appt.clone(), None).await.unwrap();

        let mut changed = appt.clone();
        changed.provider_id = target.id;
        changed.scheduled_at = ts(15);
        changed.created_at = ts(0);
        assert_eq!(
            repo.replace_appointment(changed).await.unwrap(),
            CommitOutcome::Committed
        );

        let stored = repo.find_appointment(appt.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_id, target.id);
        assert_eq!(stored.scheduled_at, ts(15));
        assert_eq!(stored.created_at, appt.created_at);

        let missing = appointment(Ulid::new(), p.id);
        assert_eq!(
            repo.replace_appointment(missing.clone()).await.unwrap(),
            CommitOutcome::AppointmentMissing(missing.id)
        );
    }

    #[tokio::test]
    async fn snapshot_rebuilds_same_state() {
        let (repo, p) = with_provider("Dr. Abe").await;
        let client = Ulid::new();
        let keep = appointment(client, p.id);
        let gone = appointment(client, p.id);
        repo.insert_appointment(keep.clone(), None).await.unwrap();
        repo.insert_appointment(gone.clone(), None).await.unwrap();
        repo.delete_appointment(gone.id).await.unwrap();

        let events = repo.snapshot();
        assert_eq!(events.len(), 2);

        let rebuilt = InMemoryRepository::from_events(&events);
        assert_eq!(rebuilt.find_provider(p.id).await.unwrap(), Some(p));
        assert_eq!(rebuilt.find_appointment(keep.id).await.unwrap(), Some(keep));
        assert_eq!(rebuilt.count_for(&client), 1);
    }
}
