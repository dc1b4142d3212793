//! CLI subcommands and their output.

use bookdesk::api::types::{
  Book, BookRequest, Category, CategoryRequest, CreateTransactionRequest, Order, OrderStatus,
  PaymentMethod, Transaction, TransactionStatus, TransactionUpdateRequest,
};
use bookdesk::api::BookstoreClient;
use clap::{Args, Subcommand};
use color_eyre::Result;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Sign in and store the session token
  Login {
    #[arg(long)]
    email: String,
    #[arg(long, env = "BOOKDESK_PASSWORD", hide_env_values = true)]
    password: String,
  },
  /// Forget the stored session token
  Logout,
  /// Show the signed-in user
  Whoami,
  /// Manage the book catalog
  #[command(subcommand)]
  Books(BookCommand),
  /// Manage categories
  #[command(subcommand)]
  Categories(CategoryCommand),
  /// Review and update customer orders
  #[command(subcommand)]
  Orders(OrderCommand),
  /// Inspect payment transactions
  #[command(subcommand)]
  Transactions(TransactionCommand),
}

#[derive(Args, Debug)]
pub struct BookFields {
  #[arg(long)]
  title: String,
  #[arg(long)]
  author: String,
  #[arg(long)]
  price: f64,
  #[arg(long, default_value_t = 0)]
  stock: i64,
  #[arg(long)]
  category: String,
  #[arg(long, default_value = "")]
  description: String,
}

impl From<BookFields> for BookRequest {
  fn from(f: BookFields) -> Self {
    Self {
      title: f.title,
      author: f.author,
      price: f.price,
      stock: f.stock,
      description: f.description,
      category_id: f.category,
    }
  }
}

#[derive(Subcommand, Debug)]
pub enum BookCommand {
  List,
  Show { id: String },
  Create(BookFields),
  Update {
    id: String,
    #[command(flatten)]
    fields: BookFields,
  },
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum CategoryCommand {
  List,
  Show { id: String },
  Create { name: String },
  Rename { id: String, name: String },
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum OrderCommand {
  List {
    /// Only orders placed by this user
    #[arg(long)]
    user: Option<String>,
    /// Only orders with this status
    #[arg(long)]
    status: Option<OrderStatus>,
  },
  Show { id: String },
  /// Move an order to a new status (PENDING, PAID, CANCELLED, ...)
  Status { id: String, status: OrderStatus },
  Delete { id: String },
}

#[derive(Subcommand, Debug)]
pub enum TransactionCommand {
  List {
    /// Only the signed-in user's transactions
    #[arg(long)]
    mine: bool,
    #[arg(long)]
    status: Option<TransactionStatus>,
  },
  Show { id: String },
  /// The transaction paying for an order
  ByOrder { order_id: String },
  /// Totals by status
  Stats,
  Create {
    #[arg(long)]
    order: String,
    #[arg(long)]
    method: PaymentMethod,
    #[arg(long)]
    amount: f64,
  },
  /// Set a transaction's status (PENDING, SUCCESS, FAILED, CANCELLED)
  SetStatus {
    id: String,
    status: TransactionStatus,
    #[arg(long)]
    reason: Option<String>,
  },
  Delete { id: String },
}

pub async fn run(client: &BookstoreClient, command: Command) -> Result<()> {
  match command {
    Command::Login { email, password } => {
      client.login(&email, &password).await?;
      println!("Signed in as {email}");
    }
    Command::Logout => {
      client.logout()?;
      println!("Signed out");
    }
    Command::Whoami => match client.current_user().await? {
      Some(user) => println!("{} <{}> ({})", user.name, user.email, user.role),
      None => println!("Not signed in"),
    },
    Command::Books(cmd) => run_books(client, cmd).await?,
    Command::Categories(cmd) => run_categories(client, cmd).await?,
    Command::Orders(cmd) => run_orders(client, cmd).await?,
    Command::Transactions(cmd) => run_transactions(client, cmd).await?,
  }
  Ok(())
}

async fn run_books(client: &BookstoreClient, cmd: BookCommand) -> Result<()> {
  match cmd {
    BookCommand::List => {
      let books = client.books().await?;
      books.iter().for_each(print_book);
      println!("{} books", books.len());
    }
    BookCommand::Show { id } => {
      let book = client.book(&id).await?;
      print_book(&book);
      if !book.description.is_empty() {
        println!("\n{}", book.description);
      }
    }
    BookCommand::Create(fields) => {
      let book = client.create_book(&fields.into()).await?;
      println!("Created book {}", book.id);
    }
    BookCommand::Update { id, fields } => {
      let book = client.update_book(&id, &fields.into()).await?;
      println!("Updated book {}", book.id);
    }
    BookCommand::Delete { id } => {
      client.delete_book(&id).await?;
      println!("Deleted book {id}");
    }
  }
  Ok(())
}

async fn run_categories(client: &BookstoreClient, cmd: CategoryCommand) -> Result<()> {
  match cmd {
    CategoryCommand::List => client.categories().await?.iter().for_each(print_category),
    CategoryCommand::Show { id } => print_category(&client.category(&id).await?),
    CategoryCommand::Create { name } => {
      let category = client.create_category(&CategoryRequest { name }).await?;
      println!("Created category {}", category.id);
    }
    CategoryCommand::Rename { id, name } => {
      let category = client.update_category(&id, &CategoryRequest { name }).await?;
      println!("Renamed category {} to {}", category.id, category.name);
    }
    CategoryCommand::Delete { id } => {
      client.delete_category(&id).await?;
      println!("Deleted category {id}");
    }
  }
  Ok(())
}

async fn run_orders(client: &BookstoreClient, cmd: OrderCommand) -> Result<()> {
  match cmd {
    OrderCommand::List { user, status } => {
      let orders = match user {
        Some(user) => client.user_orders(&user).await?,
        None => client.orders().await?,
      };
      orders
        .iter()
        .filter(|o| status.map_or(true, |s| o.status == s))
        .for_each(print_order);
    }
    OrderCommand::Show { id } => {
      let order = client.order(&id).await?;
      print_order(&order);
      for item in &order.items {
        let title = item.book.as_ref().map_or(item.book_id.as_str(), |b| b.title.as_str());
        println!("  {:>3} x {:<40} {:>9.2}", item.quantity, title, item.price);
      }
    }
    OrderCommand::Status { id, status } => {
      let order = client.update_order_status(&id, status).await?;
      println!("Order {} is now {}", order.id, order.status.as_str());
    }
    OrderCommand::Delete { id } => {
      client.delete_order(&id).await?;
      println!("Deleted order {id}");
    }
  }
  Ok(())
}

async fn run_transactions(client: &BookstoreClient, cmd: TransactionCommand) -> Result<()> {
  match cmd {
    TransactionCommand::List { mine, status } => {
      let transactions = if mine {
        client.user_transactions().await?
      } else {
        client.transactions().await?
      };
      transactions
        .iter()
        .filter(|t| status.map_or(true, |s| t.status == s))
        .for_each(print_transaction);
    }
    TransactionCommand::Show { id } => print_transaction(&client.transaction(&id).await?),
    TransactionCommand::ByOrder { order_id } => {
      print_transaction(&client.transaction_by_order(&order_id).await?)
    }
    TransactionCommand::Stats => {
      let stats = client.transaction_stats().await?;
      println!("total      {:>6}  {:>12.2}", stats.total, stats.total_amount);
      println!("success    {:>6}  {:>12.2}", stats.success, stats.success_amount);
      println!("pending    {:>6}", stats.pending);
      println!("failed     {:>6}", stats.failed);
      println!("cancelled  {:>6}", stats.cancelled);
      println!("success rate {:.1}%", stats.success_rate());
    }
    TransactionCommand::Create {
      order,
      method,
      amount,
    } => {
      let request = CreateTransactionRequest {
        order_id: order,
        payment_method: method,
        amount,
      };
      let transaction = client.create_transaction(&request).await?;
      println!("Created transaction {}", transaction.id);
    }
    TransactionCommand::SetStatus { id, status, reason } => {
      let update = TransactionUpdateRequest {
        failure_reason: reason,
        ..TransactionUpdateRequest::status(status)
      };
      let transaction = client.update_transaction_status(&id, &update).await?;
      println!(
        "Transaction {} is now {}",
        transaction.id,
        transaction.status.as_str()
      );
    }
    TransactionCommand::Delete { id } => {
      client.delete_transaction(&id).await?;
      println!("Deleted transaction {id}");
    }
  }
  Ok(())
}

fn print_book(book: &Book) {
  let category = book.category.as_ref().map_or("", |c| c.name.as_str());
  println!(
    "{:<36}  {:<40}  {:<24}  {:>8.2}  {:>4}  {}",
    book.id, book.title, book.author, book.price, book.stock, category
  );
}

fn print_category(category: &Category) {
  println!("{:<36}  {}", category.id, category.name);
}

fn print_order(order: &Order) {
  let created = order
    .created_at
    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
    .unwrap_or_default();
  println!(
    "{:<36}  {:<36}  {:<10}  {:>9.2}  {}",
    order.id,
    order.user_id,
    order.status.as_str(),
    order.total_price,
    created
  );
}

fn print_transaction(t: &Transaction) {
  let mut line = format!(
    "{:<36}  order {:<36}  {:<10}  {:>9.2}",
    t.id,
    t.order_id,
    t.status.as_str(),
    t.amount
  );
  if t.can_retry() && !t.failure_reason.is_empty() {
    line.push_str(&format!("  ({})", t.failure_reason));
  }
  println!("{line}");
}
