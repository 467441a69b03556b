//! HTTP client for a remote ledger gateway.
//!
//! The gateway fronts the shared attendance ledger and exposes it as REST:
//!
//! | call | route |
//! |---|---|
//! | classrooms | `GET /classrooms` |
//! | create classroom | `POST /classrooms` (409 on duplicate name) |
//! | students | `GET /classrooms/{id}/students` |
//! | add student | `POST /classrooms/{id}/students` (409 on duplicate reg no) |
//! | bind account | `PUT /classrooms/{id}/students/{reg_no}/account` |
//! | directory lookup | `GET /classrooms/{id}/students/{reg_no}/account` (404 = unknown) |
//! | marked students | `GET /classrooms/{id}/attendance` |
//! | mark attendance | `POST /classrooms/{id}/attendance` (409 = already exists) |

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use rollcall_core::{
    Account, AttendanceLedger, Classroom, ClassroomId, ClassroomRegistry, DirectoryError,
    DirectoryService, LedgerError, MarkedStudent, RegistrationNumber, RegistryError, Student,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct CreateClassroomRequest<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct AddStudentRequest<'a> {
    name: &'a str,
    reg_no: &'a RegistrationNumber,
}

#[derive(Serialize, Deserialize)]
struct AccountBody {
    account: Account,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Transport-level failure before any status code is known.
enum Transport {
    Timeout,
    Unavailable(String),
}

#[derive(Clone)]
pub struct LedgerGatewayClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl LedgerGatewayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LedgerError::Unavailable(format!("invalid ledger URL {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(LedgerError::Unavailable(format!("ledger URL {base_url} cannot be a base")));
        }
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Append percent-encoded path segments to the base URL.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, Transport> {
        request.send().await.map_err(|e| {
            warn!(target: "rollcalld.services.ledger", error = %e, "ledger gateway request failed");
            if e.is_timeout() {
                Transport::Timeout
            } else {
                Transport::Unavailable(e.to_string())
            }
        })
    }

    fn ledger_transport(&self, err: Transport) -> LedgerError {
        match err {
            Transport::Timeout => LedgerError::Timeout(self.timeout),
            Transport::Unavailable(msg) => LedgerError::Unavailable(msg),
        }
    }

    fn registry_transport(&self, err: Transport) -> RegistryError {
        match err {
            Transport::Timeout => {
                RegistryError::Unavailable(format!("ledger gateway timed out after {:?}", self.timeout))
            }
            Transport::Unavailable(msg) => RegistryError::Unavailable(msg),
        }
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    body.error.unwrap_or_else(|| status.to_string())
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, String> {
    response
        .json()
        .await
        .map_err(|e| format!("malformed ledger gateway response: {e}"))
}

#[async_trait]
impl AttendanceLedger for LedgerGatewayClient {
    #[instrument(skip(self), fields(classroom = %classroom))]
    async fn marked_students(
        &self,
        classroom: &ClassroomId,
    ) -> Result<Vec<MarkedStudent>, LedgerError> {
        let url = self.url(&["classrooms", classroom.as_str(), "attendance"]);
        let response = self
            .send(self.client.get(url))
            .await
            .map_err(|e| self.ledger_transport(e))?;

        match response.status() {
            s if s.is_success() => parse(response).await.map_err(LedgerError::Unavailable),
            StatusCode::NOT_FOUND => Err(LedgerError::UnknownClassroom(classroom.clone())),
            _ => Err(LedgerError::Unavailable(error_message(response).await)),
        }
    }

    #[instrument(skip(self), fields(classroom = %classroom, account = %account))]
    async fn mark_attendance(
        &self,
        classroom: &ClassroomId,
        account: &Account,
    ) -> Result<(), LedgerError> {
        let url = self.url(&["classrooms", classroom.as_str(), "attendance"]);
        let body = AccountBody {
            account: account.clone(),
        };
        let response = self
            .send(self.client.post(url).json(&body))
            .await
            .map_err(|e| self.ledger_transport(e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(LedgerError::AlreadyExists),
            StatusCode::NOT_FOUND => Err(LedgerError::UnknownClassroom(classroom.clone())),
            s if s.is_client_error() => Err(LedgerError::Rejected(error_message(response).await)),
            _ => Err(LedgerError::Unavailable(error_message(response).await)),
        }
    }
}

#[async_trait]
impl DirectoryService for LedgerGatewayClient {
    #[instrument(skip(self), fields(classroom = %classroom, reg_no = %reg_no))]
    async fn account_for(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
    ) -> Result<Option<Account>, DirectoryError> {
        let url = self.url(&["classrooms", classroom.as_str(), "students", reg_no.as_str(), "account"]);
        let response = self.send(self.client.get(url)).await.map_err(|e| match e {
            Transport::Timeout => DirectoryError::Timeout(self.timeout),
            Transport::Unavailable(msg) => DirectoryError::Unavailable(msg),
        })?;

        match response.status() {
            s if s.is_success() => {
                let body: AccountBody = parse(response).await.map_err(DirectoryError::Unavailable)?;
                Ok(Some(body.account))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(DirectoryError::Unavailable(error_message(response).await)),
        }
    }
}

#[async_trait]
impl ClassroomRegistry for LedgerGatewayClient {
    async fn create_classroom(&self, name: &str) -> Result<Classroom, RegistryError> {
        rollcall_core::registry::validate_label("classroom name", name)?;
        let url = self.url(&["classrooms"]);
        let response = self
            .send(self.client.post(url).json(&CreateClassroomRequest { name }))
            .await
            .map_err(|e| self.registry_transport(e))?;

        match response.status() {
            s if s.is_success() => parse(response).await.map_err(RegistryError::Unavailable),
            StatusCode::CONFLICT => Err(RegistryError::DuplicateName(name.to_string())),
            _ => Err(RegistryError::Unavailable(error_message(response).await)),
        }
    }

    async fn classrooms(&self) -> Result<Vec<Classroom>, RegistryError> {
        let response = self
            .send(self.client.get(self.url(&["classrooms"])))
            .await
            .map_err(|e| self.registry_transport(e))?;

        if response.status().is_success() {
            parse(response).await.map_err(RegistryError::Unavailable)
        } else {
            Err(RegistryError::Unavailable(error_message(response).await))
        }
    }

    async fn add_student(
        &self,
        classroom: &ClassroomId,
        name: &str,
        reg_no: &RegistrationNumber,
    ) -> Result<(), RegistryError> {
        rollcall_core::registry::validate_label("student name", name)?;
        rollcall_core::registry::validate_label("registration number", reg_no.as_str())?;
        let url = self.url(&["classrooms", classroom.as_str(), "students"]);
        let response = self
            .send(self.client.post(url).json(&AddStudentRequest { name, reg_no }))
            .await
            .map_err(|e| self.registry_transport(e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(RegistryError::DuplicateRegNo(reg_no.clone())),
            StatusCode::NOT_FOUND => Err(RegistryError::UnknownClassroom(classroom.clone())),
            _ => Err(RegistryError::Unavailable(error_message(response).await)),
        }
    }

    async fn bind_account(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
        account: &Account,
    ) -> Result<(), RegistryError> {
        let url = self.url(&["classrooms", classroom.as_str(), "students", reg_no.as_str(), "account"]);
        let body = AccountBody {
            account: account.clone(),
        };
        let response = self
            .send(self.client.put(url).json(&body))
            .await
            .map_err(|e| self.registry_transport(e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(RegistryError::AccountInUse(account.clone())),
            StatusCode::NOT_FOUND => Err(RegistryError::UnknownStudent(reg_no.clone())),
            _ => Err(RegistryError::Unavailable(error_message(response).await)),
        }
    }

    async fn students(&self, classroom: &ClassroomId) -> Result<Vec<Student>, RegistryError> {
        let url = self.url(&["classrooms", classroom.as_str(), "students"]);
        let response = self
            .send(self.client.get(url))
            .await
            .map_err(|e| self.registry_transport(e))?;

        match response.status() {
            s if s.is_success() => parse(response).await.map_err(RegistryError::Unavailable),
            StatusCode::NOT_FOUND => Err(RegistryError::UnknownClassroom(classroom.clone())),
            _ => Err(RegistryError::Unavailable(error_message(response).await)),
        }
    }
}
