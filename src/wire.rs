use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SeatlineAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct SeatlineHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SeatlineQueryParser>,
}

impl SeatlineHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SeatlineQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse and run one statement, recording query metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertResource {
                id,
                name,
                capacity,
                overflow,
            } => {
                engine
                    .create_resource(id, name, capacity, overflow)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource {
                id,
                name,
                capacity,
                overflow,
            } => {
                let update = ResourceUpdate {
                    name,
                    capacity,
                    overflow,
                };
                engine.update_resource(id, update).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetResourceOpen { id, open } => {
                if open {
                    engine.reopen_resource(id).await
                } else {
                    engine.close_resource(id).await
                }
                .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                Ok(vec![resource_rows(&resources)?])
            }
            Command::InsertReservation {
                resource_id,
                subject_id,
                notes,
            } => {
                let reservation = engine
                    .request_reservation(resource_id, &subject_id, notes.as_deref())
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(std::slice::from_ref(&reservation))?])
            }
            Command::CancelReservation { id, acting_subject } => {
                engine
                    .cancel_reservation(id, &acting_subject)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::CompleteReservation { id } => {
                engine.complete_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectReservation { id } => {
                let found = match engine.get_reservation_by_id(id).await {
                    Ok(r) => vec![r],
                    Err(EngineError::ReservationNotFound(_)) => vec![],
                    Err(e) => return Err(engine_err(e)),
                };
                Ok(vec![reservation_rows(&found)?])
            }
            Command::SelectReservations {
                resource_id,
                subject_id,
            } => {
                let found = match subject_id {
                    Some(subject) => engine
                        .get_reservation(resource_id, &subject)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .collect(),
                    None => engine
                        .list_reservations(resource_id)
                        .await
                        .map_err(engine_err)?,
                };
                Ok(vec![reservation_rows(&found)?])
            }
            Command::SelectWaitlist { resource_id } => {
                let waitlist = engine.list_waitlist(resource_id).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(&waitlist)?])
            }
            Command::SelectAvailability { resource_id } => {
                let a = engine
                    .get_availability(resource_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&a.resource_id.to_string())?;
                encoder.encode_field(&i64::from(a.capacity))?;
                encoder.encode_field(&(a.confirmed_count as i64))?;
                encoder.encode_field(&(a.waitlist_length as i64))?;
                encoder.encode_field(&a.open)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("overflow", Type::VARCHAR),
        text_field("open", Type::BOOL),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("subject_id", Type::VARCHAR),
        text_field("state", Type::VARCHAR),
        text_field("queue_position", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("notes", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("confirmed_count", Type::INT8),
        text_field("waitlist_length", Type::INT8),
        text_field("open", Type::BOOL),
    ]
}

fn resource_rows(resources: &[ResourceInfo]) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema());
    let mut rows = Vec::with_capacity(resources.len());
    for r in resources {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&r.id.to_string())?;
        encoder.encode_field(&r.name)?;
        encoder.encode_field(&i64::from(r.capacity))?;
        encoder.encode_field(&r.overflow.as_str())?;
        encoder.encode_field(&r.open)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let mut rows = Vec::with_capacity(reservations.len());
    for r in reservations {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&r.id.to_string())?;
        encoder.encode_field(&r.resource_id.to_string())?;
        encoder.encode_field(&r.subject_id)?;
        encoder.encode_field(&r.state.as_str())?;
        encoder.encode_field(&r.queue_position.map(|p| p as i64))?;
        encoder.encode_field(&r.created_at)?;
        encoder.encode_field(&r.notes)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row shape a statement will produce, judged from its text so that
/// statements with unbound `$n` placeholders can be described.
fn describe_schema(statement: &str) -> Vec<FieldInfo> {
    let upper = statement.trim_start().to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("AVAILABILITY") {
            availability_schema()
        } else if upper.contains("RESERVATIONS") || upper.contains("WAITLIST") {
            reservation_schema()
        } else if upper.contains("RESOURCES") {
            resource_schema()
        } else {
            vec![]
        }
    } else if upper.starts_with("INSERT") && upper.contains("RESERVATIONS") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SeatlineHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SeatlineQueryParser;

#[async_trait]
impl QueryParser for SeatlineQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SeatlineHandler {
    type Statement = String;
    type QueryParser = SeatlineQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&engine, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
        )))
    }
}

/// `(start, end, n)` for every `$n` placeholder outside quoted literals.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which lands in the same place
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>() {
                    found.push((start, i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|&(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute `$1`, `$2`, ... with bound text-format values as quoted literals.
///
/// One left-to-right pass over the statement; substituted values are never
/// scanned again.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SeatlineFactory {
    handler: Arc<SeatlineHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SeatlineAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SeatlineFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(SeatlineHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SeatlineAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SeatlineFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SeatlineFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResourceNotFound(_) | EngineError::ReservationNotFound(_) => "P0002",
        EngineError::ResourceClosed(_)
        | EngineError::AlreadyTerminal { .. }
        | EngineError::InvalidTransition { .. }
        | EngineError::HasActiveReservations(_)
        | EngineError::CapacityBelowConfirmed { .. }
        | EngineError::InvalidCapacity(_) => "55000",
        EngineError::ResourceAtCapacityNoWaitlist { .. } => "53400",
        EngineError::StoreTransactionConflict(_) => "40001",
        EngineError::StoreUnavailable(_) => "58000",
        EngineError::ResourceAlreadyExists(_) | EngineError::LimitExceeded(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
