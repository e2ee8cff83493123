use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type, METADATA_USER};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::InnkeepAuthSource;
use crate::engine::{Engine, EngineError};
use crate::identity::SessionIdentity;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

pub struct InnkeepHandler {
    engine: Arc<Engine>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    /// The login name of the session is the booking principal.
    fn session_identity<C: ClientInfo>(client: &C) -> SessionIdentity {
        SessionIdentity::new(client.metadata().get(METADATA_USER).cloned())
    }

    /// Execute a simple-query script statement by statement. Stops at the
    /// first failure; earlier statements stay applied.
    async fn run_batch(&self, identity: SessionIdentity, sql: &str) -> PgWireResult<Vec<Response>> {
        let mut responses = Vec::new();
        for cmd in sql::parse_batch(sql).map_err(sql_err)? {
            responses.extend(self.run_command(identity.clone(), cmd).await?);
        }
        Ok(responses)
    }

    async fn run(&self, identity: SessionIdentity, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        self.run_command(identity, cmd).await
    }

    async fn run_command(&self, identity: SessionIdentity, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(identity, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        identity: SessionIdentity,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResort { name, owner, address } => {
                engine
                    .create_resort(name, owner, address)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertRoom { spec } => {
                engine.create_room(spec).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPhoto { resort, room, photo } => {
                engine
                    .add_photo(&resort, room, photo)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteRoom { resort, room } => {
                engine.delete_room(&resort, room).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation { request, returning } => {
                // Run the workflow on its own task so a client hanging up
                // mid-payment cannot abandon a captured charge unpersisted.
                let engine = engine.clone();
                let info = tokio::spawn(async move {
                    engine.commit_reservation(&request, &identity).await
                })
                .await
                .map_err(|e| internal_err(format!("commit task failed: {e}")))?
                .map_err(engine_err)?;

                if returning {
                    let schema = Arc::new(reservations_schema());
                    let row = encode_reservation(&schema, &info);
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![row]),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::SelectRooms { criteria } => {
                let page = engine.search(&criteria).await.map_err(engine_err)?;
                let schema = Arc::new(rooms_schema());
                let rows: Vec<PgWireResult<_>> = page
                    .rooms
                    .iter()
                    .map(|room| encode_room(&schema, room))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::CountRooms { criteria } => {
                let count = engine.count(&criteria).await.map_err(engine_err)?;
                let schema = Arc::new(count_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(count as i64))?;
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(encoder.take_row())]),
                ))])
            }
            Command::SelectAvailability { resort, room, start, end } => {
                let available = engine
                    .check_availability(&resort, room, &start, &end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resort)?;
                encoder.encode_field(&(room as i64))?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&available)?;
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(encoder.take_row())]),
                ))])
            }
            Command::SelectReservations { resort, room } => {
                let reservations = engine
                    .get_reservations(&resort, room)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .iter()
                    .map(|info| encode_reservation(&schema, info))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resort", Type::VARCHAR),
        text_field("number", Type::INT8),
        text_field("country", Type::VARCHAR),
        text_field("city", Type::VARCHAR),
        text_field("street", Type::VARCHAR),
        text_field("street_number", Type::VARCHAR),
        text_field("price", Type::VARCHAR),
        text_field("currency", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("single_beds", Type::INT8),
        text_field("double_beds", Type::INT8),
        text_field("king_beds", Type::INT8),
        text_field("amenities", Type::VARCHAR),
        text_field("photos", Type::VARCHAR),
    ]
}

fn count_schema() -> Vec<FieldInfo> {
    vec![text_field("count", Type::INT8)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resort", Type::VARCHAR),
        text_field("room", Type::INT8),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("available", Type::BOOL),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resort", Type::VARCHAR),
        text_field("room", Type::INT8),
        text_field("user", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("amount", Type::VARCHAR),
        text_field("currency", Type::VARCHAR),
    ]
}

/// Result columns of a statement, for Describe. Empty for plain writes.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(sql) {
        Ok(Command::SelectRooms { .. }) => rooms_schema(),
        Ok(Command::CountRooms { .. }) => count_schema(),
        Ok(Command::SelectAvailability { .. }) => availability_schema(),
        Ok(Command::SelectReservations { .. })
        | Ok(Command::InsertReservation { returning: true, .. }) => reservations_schema(),
        _ => vec![],
    }
}

fn encode_room(
    schema: &Arc<Vec<FieldInfo>>,
    room: &RoomSummary,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let amenities: Vec<&str> = room.amenities.iter().map(RoomAmenity::as_str).collect();
    let photos = serde_json::to_string(&room.photos)
        .map_err(|e| internal_err(format!("photo encoding failed: {e}")))?;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&room.resort)?;
    encoder.encode_field(&(room.number as i64))?;
    encoder.encode_field(&room.country)?;
    encoder.encode_field(&room.city)?;
    encoder.encode_field(&room.street)?;
    encoder.encode_field(&room.street_number)?;
    encoder.encode_field(&format_price(room.price))?;
    encoder.encode_field(&room.currency)?;
    encoder.encode_field(&(room.capacity as i64))?;
    encoder.encode_field(&(room.beds.single as i64))?;
    encoder.encode_field(&(room.beds.double as i64))?;
    encoder.encode_field(&(room.beds.king_size as i64))?;
    encoder.encode_field(&amenities.join(","))?;
    encoder.encode_field(&photos)?;
    Ok(encoder.take_row())
}

fn encode_reservation(
    schema: &Arc<Vec<FieldInfo>>,
    info: &ReservationInfo,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&info.id.to_string())?;
    encoder.encode_field(&info.resort)?;
    encoder.encode_field(&(info.room as i64))?;
    encoder.encode_field(&info.user)?;
    encoder.encode_field(&format_day(info.start))?;
    encoder.encode_field(&format_day(info.end))?;
    encoder.encode_field(&format_price(info.amount))?;
    encoder.encode_field(&info.currency)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run_batch(Self::session_identity(client), query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
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
        Ok(result_schema(&neutralize_params(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(Self::session_identity(client), &sql).await?;
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
            result_schema(&neutralize_params(&target.statement)),
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
        Ok(DescribePortalResponse::new(result_schema(&substitute_params(target))))
    }
}

/// Rewrite `$N` placeholders in one left-to-right pass over the statement.
/// Quoted text is copied as is, and substituted values are never rescanned.
/// `render(n)` returning `None` leaves the placeholder untouched.
fn rewrite_placeholders(sql: &str, mut render: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((i, c)) = chars.next() {
        match quote {
            // A doubled quote closes and reopens, so escapes need no special case.
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '$' => {
                let digits = i + 1;
                let mut end = digits;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                match sql[digits..end].parse().ok().and_then(|n| render(n)) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&sql[i..end]),
                }
            }
            None => out.push(c),
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    rewrite_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Replace every placeholder with a dummy literal so an unbound statement
/// still parses far enough to pick its result schema.
fn neutralize_params(sql: &str) -> String {
    rewrite_placeholders(sql, |n| (n >= 1).then(|| "'0'".to_string()))
}

/// Bind text-format parameters as quoted literals; a NULL binds as `NULL`.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    rewrite_placeholders(sql, |n| {
        let param = params.get(n.checked_sub(1)?)?;
        Some(match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
    })
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(InnkeepFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

fn internal_err(message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "XX000".into(),
        message,
    )))
}
