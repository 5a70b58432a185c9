use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::dto::application_dto::{
    ApplicantSummary, ApplicationWithApplicant, FinalizePreview, RoomSummary,
    StudentApplicationView, StudentProfileSummary,
};
use crate::error::{Error, Result};
use crate::models::{
    actor::{Actor, Role},
    application::{Application, ApplicationStatus, NewApplication},
    conversation::NewConversation,
    payment::{NewPayment, PaymentSplit, PaymentStatus},
    rental::{NewRental, Rental},
    room::Room,
};
use crate::store::{Store, StoreError, StoreResult};
use crate::utils::time;

/// Runs a step whose failure must not abort the surrounding flow.
/// The error is logged and swallowed.
async fn best_effort<T, F>(step: &'static str, application_id: Uuid, fut: F) -> Option<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(%application_id, step, error = %e, "Non-critical step failed");
            None
        }
    }
}

fn already_confirmed() -> Error {
    Error::BadRequest("Payment has already been confirmed".into())
}

#[derive(Clone)]
pub struct ApplicationService {
    store: Arc<dyn Store>,
}

impl ApplicationService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn load_application(&self, id: Uuid) -> Result<Application> {
        self.store
            .get_application(id)
            .await?
            .ok_or_else(|| Error::NotFound("Application not found".into()))
    }

    async fn load_room(&self, id: Uuid) -> Result<Room> {
        self.store
            .get_room(id)
            .await?
            .ok_or_else(|| Error::NotFound("Room not found".into()))
    }

    /// Loads the room and checks that `owner` is its host.
    async fn owned_room(&self, room_id: Uuid, owner: &Actor) -> Result<Room> {
        owner.require(Role::Elderly)?;
        let room = self.load_room(room_id).await?;
        if room.elderly_id != owner.id {
            return Err(Error::Forbidden("You do not own this room".into()));
        }
        Ok(room)
    }

    pub async fn submit(&self, room_id: Uuid, student: &Actor, message: String) -> Result<Application> {
        student.require(Role::Student)?;
        let room = self.load_room(room_id).await?;
        if !room.is_available {
            return Err(Error::BadRequest("Room is no longer available".into()));
        }

        let application = self
            .store
            .insert_application(NewApplication {
                room_id,
                student_id: student.id,
                message,
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(_) => {
                    Error::Conflict("You have already applied to this room".into())
                }
                other => other.into(),
            })?;

        tracing::info!(
            application_id = %application.id,
            %room_id,
            student_id = %student.id,
            "Application submitted"
        );
        Ok(application)
    }

    /// Moves a pending application to `awaiting_payment`, opens the
    /// conversation between host and student and rejects the other pending
    /// applications of the room.
    ///
    /// Only the status change is critical. Conversation creation and the
    /// sibling rejection are logged on failure and the call still succeeds.
    /// Accepting an application that is already awaiting payment re-runs the
    /// two follow-up steps, which are idempotent.
    pub async fn accept(
        &self,
        application_id: Uuid,
        room_id: Uuid,
        student_id: Uuid,
        owner: &Actor,
    ) -> Result<Application> {
        let room = self.owned_room(room_id, owner).await?;
        let application = self.load_application(application_id).await?;
        if application.room_id != room.id || application.student_id != student_id {
            return Err(Error::BadRequest(
                "Application does not belong to this room and student".into(),
            ));
        }

        let application = match application.status {
            ApplicationStatus::Pending => {
                let updated = self
                    .store
                    .set_application_status(application_id, ApplicationStatus::AwaitingPayment)
                    .await?;
                tracing::info!(%application_id, %room_id, "Application accepted, awaiting payment");
                updated
            }
            ApplicationStatus::AwaitingPayment => {
                tracing::info!(%application_id, "Application already accepted, re-running follow-ups");
                application
            }
            other => {
                return Err(Error::BadRequest(format!(
                    "Application is {} and can no longer be accepted",
                    other.as_str()
                )));
            }
        };

        let conversation = self
            .store
            .insert_conversation(NewConversation {
                room_id: room.id,
                elderly_id: room.elderly_id,
                student_id,
            })
            .await;
        match conversation {
            Ok(conversation) => {
                tracing::info!(%application_id, conversation_id = %conversation.id, "Conversation created");
            }
            Err(e) if e.is_unique_violation() => {
                tracing::info!(%application_id, "Conversation already exists");
            }
            Err(e) => {
                tracing::warn!(%application_id, error = %e, "Failed to create conversation");
            }
        }

        if let Some(rejected) = best_effort(
            "reject_pending_siblings",
            application_id,
            self.store.reject_pending_siblings(room.id, application_id),
        )
        .await
        {
            tracing::info!(%application_id, rejected, "Rejected competing applications");
        }

        Ok(application)
    }

    pub async fn reject(&self, application_id: Uuid, owner: &Actor) -> Result<Application> {
        let application = self.load_application(application_id).await?;
        self.owned_room(application.room_id, owner).await?;

        let application = self
            .store
            .set_application_status(application_id, ApplicationStatus::Rejected)
            .await?;
        tracing::info!(%application_id, "Application rejected");
        Ok(application)
    }

    /// Loads an application of `student` that is waiting for payment,
    /// together with its room.
    async fn payable(&self, application_id: Uuid, student: &Actor) -> Result<(Application, Room)> {
        student.require(Role::Student)?;
        let application = self
            .store
            .get_application(application_id)
            .await?
            .filter(|a| a.student_id == student.id)
            .ok_or_else(|| Error::NotFound("Application not found".into()))?;
        if application.status != ApplicationStatus::AwaitingPayment {
            return Err(Error::BadRequest(
                "This application is not awaiting payment".into(),
            ));
        }
        let room = self.load_room(application.room_id).await?;
        Ok((application, room))
    }

    pub async fn finalize_preview(
        &self,
        application_id: Uuid,
        student: &Actor,
    ) -> Result<FinalizePreview> {
        let (application, room) = self.payable(application_id, student).await?;
        let owner_name = self
            .store
            .get_profile(room.elderly_id)
            .await?
            .map(|p| p.full_name)
            .unwrap_or_default();
        Ok(FinalizePreview {
            application_id: application.id,
            room_id: room.id,
            room_title: room.title.clone(),
            owner_name,
            split: PaymentSplit::from_amount(room.rent_amount()),
        })
    }

    /// Records the student's off-platform payment: creates the rental and
    /// its first payment, then takes the room off the market.
    ///
    /// Each write is critical and surfaces its error, but earlier writes are
    /// not undone. The application status is left at `awaiting_payment`.
    pub async fn finalize_payment(&self, application_id: Uuid, student: &Actor) -> Result<Rental> {
        let (application, room) = self.payable(application_id, student).await?;
        if self
            .store
            .find_active_rental(room.id, student.id)
            .await?
            .is_some()
        {
            return Err(already_confirmed());
        }

        let now = time::now();
        let split = PaymentSplit::from_amount(room.rent_amount());

        let rental = self
            .store
            .insert_rental(NewRental {
                room_id: room.id,
                student_id: student.id,
                elderly_id: room.elderly_id,
                monthly_amount: split.amount,
                start_date: now,
            })
            .await
            .map_err(|e| match e {
                // A concurrent finalize won the race.
                StoreError::UniqueViolation(_) => already_confirmed(),
                other => other.into(),
            })?;

        let payment = self
            .store
            .insert_payment(NewPayment {
                rental_id: rental.id,
                split,
                payment_date: Some(now),
                due_date: time::one_month_after(now),
                status: PaymentStatus::Completed,
            })
            .await?;

        self.store.set_room_availability(room.id, false).await?;

        tracing::info!(
            application_id = %application.id,
            rental_id = %rental.id,
            payment_id = %payment.id,
            amount = %split.amount,
            "Payment confirmed, rental started"
        );
        Ok(rental)
    }

    /// Applications of a room for its host, each with the applicant's
    /// profile. Missing profile rows fall back to empty fields.
    pub async fn list_for_room(
        &self,
        room_id: Uuid,
        owner: &Actor,
    ) -> Result<Vec<ApplicationWithApplicant>> {
        self.owned_room(room_id, owner).await?;
        let applications = self.store.list_applications_for_room(room_id).await?;
        if applications.is_empty() {
            return Ok(Vec::new());
        }

        let student_ids: Vec<Uuid> = applications.iter().map(|a| a.student_id).collect();
        let profiles: HashMap<Uuid, _> = match self.store.get_profiles(&student_ids).await {
            Ok(rows) => rows.into_iter().map(|p| (p.id, p)).collect(),
            Err(e) => {
                tracing::warn!(%room_id, error = %e, "Failed to load applicant profiles");
                HashMap::new()
            }
        };
        let student_profiles: HashMap<Uuid, _> =
            match self.store.get_student_profiles(&student_ids).await {
                Ok(rows) => rows.into_iter().map(|p| (p.id, p)).collect(),
                Err(e) => {
                    tracing::warn!(%room_id, error = %e, "Failed to load student profiles");
                    HashMap::new()
                }
            };

        Ok(applications
            .into_iter()
            .map(|application| {
                let profile = profiles.get(&application.student_id);
                let student_profile =
                    student_profiles
                        .get(&application.student_id)
                        .map(|sp| StudentProfileSummary {
                            university: sp.university.clone(),
                            course: sp.course.clone(),
                            student_type: sp.student_type,
                        });
                ApplicationWithApplicant {
                    student: ApplicantSummary {
                        id: application.student_id,
                        full_name: profile.map(|p| p.full_name.clone()).unwrap_or_default(),
                        age: profile.map(|p| p.age).unwrap_or(0),
                        bio: profile.map(|p| p.bio.clone()).unwrap_or_default(),
                        student_profile,
                    },
                    id: application.id,
                    status: application.status,
                    message: application.message,
                    created_at: application.created_at,
                }
            })
            .collect())
    }

    pub async fn list_for_student(&self, student: &Actor) -> Result<Vec<StudentApplicationView>> {
        student.require(Role::Student)?;
        let applications = self.store.list_applications_for_student(student.id).await?;

        let mut views = Vec::with_capacity(applications.len());
        for application in applications {
            let room = match self.store.get_room(application.room_id).await? {
                Some(room) => {
                    let owner_name = self
                        .store
                        .get_profile(room.elderly_id)
                        .await?
                        .map(|p| p.full_name)
                        .unwrap_or_default();
                    Some(RoomSummary {
                        id: room.id,
                        title: room.title,
                        location: room.location,
                        owner_name,
                    })
                }
                None => None,
            };
            views.push(StudentApplicationView {
                id: application.id,
                status: application.status,
                message: application.message,
                created_at: application.created_at,
                room,
            });
        }
        Ok(views)
    }

    pub async fn has_applied(&self, room_id: Uuid, student: &Actor) -> Result<Option<Application>> {
        student.require(Role::Student)?;
        Ok(self.store.find_application(room_id, student.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::application::ApplicationStatus;
    use crate::store::memory::{MemoryStore, Op};
    use crate::store::MockStore;
    use chrono::Utc;
    use rust_decimal::Decimal;

    struct Fixture {
        store: Arc<MemoryStore>,
        service: ApplicationService,
        owner: Actor,
        room: Room,
    }

    fn fixture(monthly: i64, total: Option<i64>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let owner = Actor::elderly(Uuid::new_v4());
        store.add_profile(owner.id, Role::Elderly, "Maria Silva");
        let room = store.add_room(
            owner.id,
            "Quarto junto ao rio",
            Decimal::from(monthly),
            total.map(Decimal::from),
        );
        let service = ApplicationService::new(store.clone());
        Fixture {
            store,
            service,
            owner,
            room,
        }
    }

    fn new_student(store: &MemoryStore, name: &str) -> Actor {
        let student = Actor::student(Uuid::new_v4());
        store.add_profile(student.id, Role::Student, name);
        student
    }

    #[tokio::test]
    async fn full_lifecycle_from_submission_to_rental() {
        let f = fixture(250, Some(300));
        let student = new_student(&f.store, "Sara");
        let rival = new_student(&f.store, "Rui");

        let application = f
            .service
            .submit(f.room.id, &student, "Hi".into())
            .await
            .unwrap();
        assert_eq!(application.status, ApplicationStatus::Pending);
        let competing = f
            .service
            .submit(f.room.id, &rival, "Olá".into())
            .await
            .unwrap();

        let accepted = f
            .service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();
        assert_eq!(accepted.status, ApplicationStatus::AwaitingPayment);

        let conversations = f.store.conversations();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].room_id, f.room.id);
        assert_eq!(conversations[0].elderly_id, f.owner.id);
        assert_eq!(conversations[0].student_id, student.id);

        let competing = f.store.get_application(competing.id).await.unwrap().unwrap();
        assert_eq!(competing.status, ApplicationStatus::Rejected);

        let rental = f
            .service
            .finalize_payment(application.id, &student)
            .await
            .unwrap();
        assert_eq!(rental.monthly_amount, Decimal::from(300));

        let payments = f.store.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].rental_id, rental.id);
        assert_eq!(payments[0].platform_fee, Decimal::from(30));
        assert_eq!(payments[0].elderly_amount, Decimal::from(270));
        assert_eq!(payments[0].status, PaymentStatus::Completed);
        assert!(payments[0].due_date > payments[0].payment_date.unwrap());

        let room = f.store.get_room(f.room.id).await.unwrap().unwrap();
        assert!(!room.is_available);
    }

    #[tokio::test]
    async fn rental_uses_base_price_without_total() {
        let f = fixture(280, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, String::new()).await.unwrap();
        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();

        let rental = f.service.finalize_payment(application.id, &student).await.unwrap();
        assert_eq!(rental.monthly_amount, Decimal::from(280));
        let payment = &f.store.payments()[0];
        assert_eq!(payment.platform_fee + payment.elderly_amount, payment.amount);
    }

    #[tokio::test]
    async fn submit_requires_an_available_room() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        f.store.set_room_availability(f.room.id, false).await.unwrap();

        let err = f
            .service
            .submit(f.room.id, &student, "Hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let err = f
            .service
            .submit(Uuid::new_v4(), &student, "Hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_submission_is_a_conflict() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        let err = f
            .service
            .submit(f.room.id, &student, "Again".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn only_students_submit_and_only_the_host_reviews() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let err = f
            .service
            .submit(f.room.id, &f.owner, "Hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();
        let stranger = Actor::elderly(Uuid::new_v4());
        let err = f
            .service
            .accept(application.id, f.room.id, student.id, &stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = f.service.reject(application.id, &stranger).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn accepting_twice_creates_one_conversation() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        for _ in 0..2 {
            let accepted = f
                .service
                .accept(application.id, f.room.id, student.id, &f.owner)
                .await
                .unwrap();
            assert_eq!(accepted.status, ApplicationStatus::AwaitingPayment);
        }
        assert_eq!(f.store.conversations().len(), 1);
    }

    #[tokio::test]
    async fn retried_accept_repairs_a_missing_conversation() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        f.store.fail_next(Op::InsertConversation);
        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();
        assert!(f.store.conversations().is_empty());

        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();
        assert_eq!(f.store.conversations().len(), 1);
    }

    #[tokio::test]
    async fn failed_cascade_does_not_block_acceptance() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let rival = new_student(&f.store, "Rui");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();
        let competing = f.service.submit(f.room.id, &rival, "Hi".into()).await.unwrap();

        f.store.fail_next(Op::RejectPendingSiblings);
        let accepted = f
            .service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();
        assert_eq!(accepted.status, ApplicationStatus::AwaitingPayment);
        let competing = f.store.get_application(competing.id).await.unwrap().unwrap();
        assert_eq!(competing.status, ApplicationStatus::Pending);
    }

    #[tokio::test]
    async fn failed_status_change_fails_the_accept() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        f.store.fail_next(Op::SetApplicationStatus);
        let err = f
            .service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(f.store.conversations().is_empty());
    }

    #[tokio::test]
    async fn rejected_applications_cannot_be_accepted_or_paid() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        f.service.reject(application.id, &f.owner).await.unwrap();
        let again = f.service.reject(application.id, &f.owner).await.unwrap();
        assert_eq!(again.status, ApplicationStatus::Rejected);

        let err = f
            .service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = f
            .service
            .finalize_payment(application.id, &student)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn finalize_is_limited_to_the_applicant() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let other = new_student(&f.store, "Rui");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();
        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();

        let err = f
            .service
            .finalize_payment(application.id, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn second_finalize_creates_no_second_rental() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();
        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();

        f.service.finalize_payment(application.id, &student).await.unwrap();
        let err = f
            .service
            .finalize_payment(application.id, &student)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert_eq!(f.store.rentals().len(), 1);
        assert_eq!(f.store.payments().len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_leaves_the_rental_in_place() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        let application = f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();
        f.service
            .accept(application.id, f.room.id, student.id, &f.owner)
            .await
            .unwrap();

        f.store.fail_next(Op::InsertPayment);
        let err = f
            .service
            .finalize_payment(application.id, &student)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(f.store.rentals().len(), 1);
        assert!(f.store.payments().is_empty());
        let room = f.store.get_room(f.room.id).await.unwrap().unwrap();
        assert!(room.is_available);
    }

    #[tokio::test]
    async fn owner_listing_tolerates_missing_profiles() {
        let f = fixture(250, None);
        let known = new_student(&f.store, "Sara");
        f.store.add_student_profile(
            known.id,
            "Universidade de Lisboa",
            "Medicina",
            crate::models::profile::StudentType::Erasmus,
        );
        let unknown = Actor::student(Uuid::new_v4());

        f.service.submit(f.room.id, &known, "first".into()).await.unwrap();
        f.service.submit(f.room.id, &unknown, "second".into()).await.unwrap();

        let listing = f.service.list_for_room(f.room.id, &f.owner).await.unwrap();
        assert_eq!(listing.len(), 2);
        // newest first
        assert_eq!(listing[0].message, "second");
        assert_eq!(listing[0].student.full_name, "");
        assert_eq!(listing[0].student.age, 0);
        assert!(listing[0].student.student_profile.is_none());
        assert_eq!(listing[1].student.full_name, "Sara");
        assert_eq!(
            listing[1].student.student_profile.as_ref().unwrap().course,
            "Medicina"
        );

        f.store.fail_next(Op::GetProfiles);
        let listing = f.service.list_for_room(f.room.id, &f.owner).await.unwrap();
        assert_eq!(listing[1].student.full_name, "");
    }

    #[tokio::test]
    async fn student_listing_carries_room_summary() {
        let f = fixture(250, None);
        let student = new_student(&f.store, "Sara");
        f.service.submit(f.room.id, &student, "Hi".into()).await.unwrap();

        let views = f.service.list_for_student(&student).await.unwrap();
        assert_eq!(views.len(), 1);
        let room = views[0].room.as_ref().unwrap();
        assert_eq!(room.title, "Quarto junto ao rio");
        assert_eq!(room.owner_name, "Maria Silva");

        assert!(f.service.has_applied(f.room.id, &student).await.unwrap().is_some());
        let other = new_student(&f.store, "Rui");
        assert!(f.service.has_applied(f.room.id, &other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_reports_success_when_every_follow_up_fails() {
        let owner = Actor::elderly(Uuid::new_v4());
        let student_id = Uuid::new_v4();
        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4(),
            elderly_id: owner.id,
            title: "Quarto".into(),
            location: "Porto".into(),
            monthly_price: Decimal::from(200),
            total_monthly_price: None,
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        let application = Application {
            id: Uuid::new_v4(),
            room_id: room.id,
            student_id,
            status: ApplicationStatus::Pending,
            message: String::new(),
            created_at: now,
            updated_at: now,
        };

        let mut store = MockStore::new();
        let room_clone = room.clone();
        store
            .expect_get_room()
            .returning(move |_| Ok(Some(room_clone.clone())));
        let pending = application.clone();
        store
            .expect_get_application()
            .returning(move |_| Ok(Some(pending.clone())));
        let accepted = Application {
            status: ApplicationStatus::AwaitingPayment,
            ..application.clone()
        };
        store
            .expect_set_application_status()
            .withf(|_, status| *status == ApplicationStatus::AwaitingPayment)
            .times(1)
            .returning(move |_, _| Ok(accepted.clone()));
        store
            .expect_insert_conversation()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("connection reset".into())));
        store
            .expect_reject_pending_siblings()
            .times(1)
            .returning(|_, _| Err(StoreError::Unavailable("connection reset".into())));

        let service = ApplicationService::new(Arc::new(store));
        let result = service
            .accept(application.id, room.id, student_id, &owner)
            .await
            .unwrap();
        assert_eq!(result.status, ApplicationStatus::AwaitingPayment);
    }

    #[tokio::test]
    async fn concurrent_finalize_loses_to_the_active_rental_rule() {
        let student = Actor::student(Uuid::new_v4());
        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4(),
            elderly_id: Uuid::new_v4(),
            title: "Quarto".into(),
            location: "Braga".into(),
            monthly_price: Decimal::from(250),
            total_monthly_price: None,
            is_available: true,
            created_at: now,
            updated_at: now,
        };
        let application = Application {
            id: Uuid::new_v4(),
            room_id: room.id,
            student_id: student.id,
            status: ApplicationStatus::AwaitingPayment,
            message: String::new(),
            created_at: now,
            updated_at: now,
        };

        let mut store = MockStore::new();
        let awaiting = application.clone();
        store
            .expect_get_application()
            .returning(move |_| Ok(Some(awaiting.clone())));
        let room_clone = room.clone();
        store
            .expect_get_room()
            .returning(move |_| Ok(Some(room_clone.clone())));
        // The other request has not committed yet when this one checks.
        store.expect_find_active_rental().returning(|_, _| Ok(None));
        store.expect_insert_rental().times(1).returning(|_| {
            Err(StoreError::UniqueViolation(
                "idx_rentals_one_active_per_room".into(),
            ))
        });
        store.expect_insert_payment().times(0);
        store.expect_set_room_availability().times(0);

        let service = ApplicationService::new(Arc::new(store));
        let err = service
            .finalize_payment(application.id, &student)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(ref msg) if msg == "Payment has already been confirmed"));
    }

    #[tokio::test]
    async fn memory_store_allows_one_active_rental_per_room() {
        let f = fixture(250, None);
        let new_rental = |student_id| NewRental {
            room_id: f.room.id,
            student_id,
            elderly_id: f.owner.id,
            monthly_amount: Decimal::from(250),
            start_date: Utc::now(),
        };
        f.store.insert_rental(new_rental(Uuid::new_v4())).await.unwrap();
        let err = f
            .store
            .insert_rental(new_rental(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }
}
