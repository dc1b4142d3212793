//! Bookstore client with transparent caching.

use serde_json::Value;
use tracing::{debug, info};

use super::client::{Executor, HttpExecutor};
use super::envelope::{decode_ack, decode_item, decode_list};
use super::keys;
use super::mutations::MutationRequest;
use super::request::ApiRequest;
use super::types::{
  Book, BookRequest, CacheValue, Category, CategoryRequest, CreateOrderRequest,
  CreateTransactionRequest, EsewaPaymentRequest, EsewaResponseData, LoginRequest, LoginResponse,
  Order, OrderStatus, Resource, Transaction, TransactionStats, TransactionUpdateRequest,
  UpdateOrderStatusRequest, User,
};
use crate::cache::{
  CacheEffects, CacheEntry, CacheOptions, ResourceCache, ResourceKey, Subscription,
};
use crate::config::Config;
use crate::error::FetchError;
use crate::session::Session;

/// How reads treat an entry that is cached but stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
  /// Return stale data at once and refresh in the background
  #[default]
  StaleWhileRevalidate,
  /// Wait for a refetch when the cached data is stale
  WaitForFresh,
}

/// Run a request. If the server rejects the token, the session expires and
/// everything cached under that identity is dropped.
async fn execute<E: Executor>(
  executor: &E,
  session: &Session,
  cache: &ResourceCache<Resource>,
  request: ApiRequest,
) -> Result<Value, FetchError> {
  let result = executor.execute(request).await;
  if let Err(err) = &result {
    if err.is_unauthorized() {
      session.expire();
      cache.clear();
    }
  }
  result
}

fn unwrap_entry<V: CacheValue>(entry: CacheEntry<Resource>) -> Result<V, FetchError> {
  let key = entry.key.clone();
  let resource = entry.into_result()?;
  V::from_resource(&resource)
    .cloned()
    .ok_or_else(|| FetchError::Decode(format!("cache entry {key} holds a different resource")))
}

/// Replace the item with `updated.id` in cached transaction lists.
fn replace_transaction(updated: Transaction) -> impl FnOnce(&Resource) -> Resource + Send + 'static {
  move |resource| match resource {
    Resource::Transactions(list) => Resource::Transactions(
      list
        .iter()
        .map(|t| if t.id == updated.id { updated.clone() } else { t.clone() })
        .collect(),
    ),
    other => other.clone(),
  }
}

fn drop_transaction(id: String) -> impl FnOnce(&Resource) -> Resource + Send + 'static {
  move |resource| match resource {
    Resource::Transactions(list) => {
      Resource::Transactions(list.iter().filter(|t| t.id != id).cloned().collect())
    }
    other => other.clone(),
  }
}

/// Typed access to bookstore resources through a shared [`ResourceCache`].
///
/// Reads are cached per key and deduplicated; writes go straight to the
/// server and, once accepted, update the cache as declared by their
/// [`MutationRequest`].
#[derive(Clone)]
pub struct BookstoreClient<E: Executor = HttpExecutor> {
  executor: E,
  session: Session,
  cache: ResourceCache<Resource>,
  read_mode: ReadMode,
}

impl BookstoreClient<HttpExecutor> {
  /// Create a client talking to the configured server.
  pub fn new(config: &Config, session: Session) -> color_eyre::Result<Self> {
    let executor = HttpExecutor::new(&config.api, session.clone())?;
    Ok(Self::with_executor(executor, session, config.cache_options()))
  }
}

impl<E: Executor> BookstoreClient<E> {
  pub fn with_executor(executor: E, session: Session, options: CacheOptions) -> Self {
    Self {
      executor,
      session,
      cache: ResourceCache::new(options),
      read_mode: ReadMode::default(),
    }
  }

  /// Cache options with the built-in per-resource stale times and retries.
  pub fn default_options() -> CacheOptions {
    Config::default().cache_options()
  }

  pub fn with_read_mode(mut self, read_mode: ReadMode) -> Self {
    self.read_mode = read_mode;
    self
  }

  pub fn cache(&self) -> &ResourceCache<Resource> {
    &self.cache
  }

  pub fn session(&self) -> &Session {
    &self.session
  }

  /// Follow changes of one resource, e.g. `keys::books()`.
  pub fn subscribe(&self, key: &ResourceKey) -> Subscription<Resource> {
    self.cache.subscribe(key)
  }

  /// Drop every cached entry, e.g. at shutdown.
  pub fn clear_cache(&self) {
    self.cache.clear();
  }

  async fn query<V, D>(&self, key: ResourceKey, request: ApiRequest, decode: D) -> Result<V, FetchError>
  where
    V: CacheValue,
    D: Fn(&Value) -> Result<V, FetchError> + Clone + Send + Sync + 'static,
  {
    let executor = self.executor.clone();
    let session = self.session.clone();
    let cache = self.cache.clone();
    let loader = move || {
      let executor = executor.clone();
      let session = session.clone();
      let cache = cache.clone();
      let request = request.clone();
      let decode = decode.clone();
      async move {
        let body = execute(&executor, &session, &cache, request).await?;
        decode(&body).map(CacheValue::into_resource)
      }
    };

    let entry = match self.read_mode {
      ReadMode::StaleWhileRevalidate => self.cache.request(&key, loader).await,
      ReadMode::WaitForFresh => match self.cache.get(&key) {
        Some(entry) if !entry.is_stale => entry,
        _ => self.cache.fetch(&key, loader).await,
      },
    };
    unwrap_entry(entry)
  }

  /// Run a mutation and apply its declared cache effects plus whatever
  /// `effects` adds for the decoded response.
  async fn mutate<R, D, F>(&self, mutation: MutationRequest, decode: D, effects: F) -> Result<R, FetchError>
  where
    D: FnOnce(&Value) -> Result<R, FetchError>,
    F: FnOnce(&R, CacheEffects<Resource>) -> CacheEffects<Resource>,
  {
    let MutationRequest {
      request,
      invalidates,
      invalidates_prefixes,
      removes,
    } = mutation;
    debug!(%request, "running mutation");

    let op = async {
      let body = execute(&self.executor, &self.session, &self.cache, request).await?;
      decode(&body)
    };
    self
      .cache
      .mutate(op, move |value| {
        let declared = removes
          .into_iter()
          .fold(CacheEffects::new(), CacheEffects::remove)
          .invalidate_all(invalidates);
        let declared = invalidates_prefixes
          .into_iter()
          .fold(declared, CacheEffects::invalidate_prefix);
        effects(value, declared)
      })
      .await
  }

  // ==========================================================================
  // Auth
  // ==========================================================================

  /// Sign in and store the token. Cached data belongs to the previous
  /// identity, so the cache is cleared.
  pub async fn login(&self, email: &str, password: &str) -> color_eyre::Result<()> {
    let credentials = LoginRequest {
      email: email.to_string(),
      password: password.to_string(),
    };
    credentials.validate()?;

    let body = self
      .executor
      .execute(ApiRequest::post("/auth/login", &credentials)?)
      .await?;
    let LoginResponse { token } = decode_item(&body, "token")?;
    self.session.set_token(&token)?;
    self.cache.clear();
    info!("signed in as {}", email);
    Ok(())
  }

  pub fn logout(&self) -> color_eyre::Result<()> {
    self.session.clear()?;
    self.cache.clear();
    info!("signed out");
    Ok(())
  }

  /// The signed-in user, or `None` without a stored token.
  pub async fn current_user(&self) -> Result<Option<User>, FetchError> {
    if !self.session.is_authenticated() {
      return Ok(None);
    }
    self
      .query(keys::current_user(), ApiRequest::get("/auth/me"), |body| {
        decode_item::<User>(body, "user").map(Some)
      })
      .await
  }

  // ==========================================================================
  // Books
  // ==========================================================================

  pub async fn books(&self) -> Result<Vec<Book>, FetchError> {
    self
      .query(keys::books(), ApiRequest::get("/books"), |body| {
        decode_list(body, "books")
      })
      .await
  }

  pub async fn book(&self, id: &str) -> Result<Book, FetchError> {
    self
      .query(keys::book(id), ApiRequest::get(format!("/books/{id}")), |body| {
        decode_item(body, "book")
      })
      .await
  }

  pub async fn create_book(&self, book: &BookRequest) -> Result<Book, FetchError> {
    let mutation = MutationRequest::create_book(book)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Book>(body, "book"),
        |created, effects| effects.write(keys::book(&created.id), Resource::Book(created.clone())),
      )
      .await
  }

  pub async fn update_book(&self, id: &str, book: &BookRequest) -> Result<Book, FetchError> {
    let mutation = MutationRequest::update_book(id, book)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Book>(body, "book"),
        |updated, effects| effects.write(keys::book(&updated.id), Resource::Book(updated.clone())),
      )
      .await
  }

  pub async fn delete_book(&self, id: &str) -> Result<(), FetchError> {
    self
      .mutate(MutationRequest::delete_book(id), decode_ack, |_, effects| effects)
      .await
  }

  // ==========================================================================
  // Categories
  // ==========================================================================

  pub async fn categories(&self) -> Result<Vec<Category>, FetchError> {
    self
      .query(keys::categories(), ApiRequest::get("/categories"), |body| {
        decode_list(body, "categories")
      })
      .await
  }

  pub async fn category(&self, id: &str) -> Result<Category, FetchError> {
    self
      .query(
        keys::category(id),
        ApiRequest::get(format!("/categories/{id}")),
        |body| decode_item(body, "category"),
      )
      .await
  }

  pub async fn create_category(&self, category: &CategoryRequest) -> Result<Category, FetchError> {
    let mutation = MutationRequest::create_category(category)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Category>(body, "category"),
        |created, effects| {
          effects.write(keys::category(&created.id), Resource::Category(created.clone()))
        },
      )
      .await
  }

  pub async fn update_category(
    &self,
    id: &str,
    category: &CategoryRequest,
  ) -> Result<Category, FetchError> {
    let mutation = MutationRequest::update_category(id, category)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Category>(body, "category"),
        |updated, effects| {
          effects.write(keys::category(&updated.id), Resource::Category(updated.clone()))
        },
      )
      .await
  }

  pub async fn delete_category(&self, id: &str) -> Result<(), FetchError> {
    self
      .mutate(MutationRequest::delete_category(id), decode_ack, |_, effects| effects)
      .await
  }

  // ==========================================================================
  // Orders
  // ==========================================================================

  pub async fn orders(&self) -> Result<Vec<Order>, FetchError> {
    self
      .query(keys::orders(), ApiRequest::get("/orders"), |body| {
        decode_list(body, "orders")
      })
      .await
  }

  pub async fn order(&self, id: &str) -> Result<Order, FetchError> {
    self
      .query(keys::order(id), ApiRequest::get(format!("/orders/{id}")), |body| {
        decode_item(body, "order")
      })
      .await
  }

  /// Orders placed by one user. The backend has no per-user endpoint for
  /// staff, so the full list is filtered here.
  pub async fn user_orders(&self, user_id: &str) -> Result<Vec<Order>, FetchError> {
    let owner = user_id.to_string();
    self
      .query(keys::user_orders(user_id), ApiRequest::get("/orders"), move |body| {
        let orders: Vec<Order> = decode_list(body, "orders")?;
        Ok(orders.into_iter().filter(|o| o.user_id == owner).collect())
      })
      .await
  }

  pub async fn create_order(&self, order: &CreateOrderRequest) -> Result<Order, FetchError> {
    let mutation = MutationRequest::create_order(order)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Order>(body, "order"),
        |created, effects| effects.write(keys::order(&created.id), Resource::Order(created.clone())),
      )
      .await
  }

  pub async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, FetchError> {
    let mutation = MutationRequest::update_order_status(id, &UpdateOrderStatusRequest { status })?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Order>(body, "order"),
        |updated, effects| effects.write(keys::order(&updated.id), Resource::Order(updated.clone())),
      )
      .await
  }

  pub async fn delete_order(&self, id: &str) -> Result<(), FetchError> {
    self
      .mutate(MutationRequest::delete_order(id), decode_ack, |_, effects| effects)
      .await
  }

  // ==========================================================================
  // Transactions
  // ==========================================================================

  pub async fn transactions(&self) -> Result<Vec<Transaction>, FetchError> {
    self
      .query(keys::transactions(), ApiRequest::get("/transactions"), |body| {
        decode_list(body, "transactions")
      })
      .await
  }

  pub async fn user_transactions(&self) -> Result<Vec<Transaction>, FetchError> {
    self
      .query(
        keys::user_transactions(),
        ApiRequest::get("/transactions/user/my-transactions"),
        |body| decode_list(body, "transactions"),
      )
      .await
  }

  pub async fn transaction(&self, id: &str) -> Result<Transaction, FetchError> {
    self
      .query(
        keys::transaction(id),
        ApiRequest::get(format!("/transactions/{id}")),
        |body| decode_item(body, "transaction"),
      )
      .await
  }

  pub async fn transaction_by_order(&self, order_id: &str) -> Result<Transaction, FetchError> {
    self
      .query(
        keys::transaction_by_order(order_id),
        ApiRequest::get(format!("/transactions/order/{order_id}")),
        |body| decode_item(body, "transaction"),
      )
      .await
  }

  /// Totals over the full transaction list.
  pub async fn transaction_stats(&self) -> Result<TransactionStats, FetchError> {
    let transactions = self.transactions().await?;
    Ok(TransactionStats::from_transactions(&transactions))
  }

  pub async fn create_transaction(
    &self,
    transaction: &CreateTransactionRequest,
  ) -> Result<Transaction, FetchError> {
    let mutation = MutationRequest::create_transaction(transaction)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Transaction>(body, "transaction"),
        |created, effects| {
          effects.write(
            keys::transaction(&created.id),
            Resource::Transaction(created.clone()),
          )
        },
      )
      .await
  }

  pub async fn update_transaction_status(
    &self,
    id: &str,
    update: &TransactionUpdateRequest,
  ) -> Result<Transaction, FetchError> {
    let mutation = MutationRequest::update_transaction_status(id, update)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Transaction>(body, "transaction"),
        |updated, effects| {
          effects
            .write(
              keys::transaction(&updated.id),
              Resource::Transaction(updated.clone()),
            )
            .patch(keys::transactions(), replace_transaction(updated.clone()))
            .patch(keys::user_transactions(), replace_transaction(updated.clone()))
        },
      )
      .await
  }

  pub async fn delete_transaction(&self, id: &str) -> Result<(), FetchError> {
    let removed = id.to_string();
    self
      .mutate(MutationRequest::delete_transaction(id), decode_ack, move |_, effects| {
        effects
          .patch(keys::transactions(), drop_transaction(removed.clone()))
          .patch(keys::user_transactions(), drop_transaction(removed))
      })
      .await
  }

  /// Start a gateway payment for an existing transaction.
  pub async fn initiate_esewa_payment(
    &self,
    transaction_id: &str,
    payment: &EsewaPaymentRequest,
  ) -> Result<Transaction, FetchError> {
    let mutation = MutationRequest::initiate_esewa(transaction_id, payment)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Transaction>(body, "transaction"),
        |_, effects| effects,
      )
      .await
  }

  pub async fn verify_esewa_payment(
    &self,
    response: &EsewaResponseData,
  ) -> Result<Transaction, FetchError> {
    let mutation = MutationRequest::verify_esewa(response)?;
    self
      .mutate(
        mutation,
        |body| decode_item::<Transaction>(body, "transaction"),
        |_, effects| effects,
      )
      .await
  }
}

impl<E: Executor> std::fmt::Debug for BookstoreClient<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BookstoreClient")
      .field("cache", &self.cache)
      .field("read_mode", &self.read_mode)
      .finish_non_exhaustive()
  }
}
