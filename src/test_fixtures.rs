//! Shared accounts / products / reviews subgraphs for unit tests.

use std::sync::Arc;

use crate::ServiceConfig;
use crate::composition::compose;
use crate::operation::Operation;
use crate::supergraph::Supergraph;

pub(crate) const ACCOUNTS_SDL: &str = r#"
extend type Query {
    me: User
    histories: [History]
}

extend type Mutation {
    login(username: String!): User
}

type User @key(fields: "id") {
    id: ID!
    username: String!
    history: [History]
}

type Purchase {
    product: Product!
    wallet: Wallet
}

type Sale {
    product: Product!
    rating: Int!
}

union History = Purchase | Sale

interface Wallet {
    currency: String!
    amount: Float!
}

type WalletType1 implements Wallet {
    currency: String!
    amount: Float!
    specialField1: String
}

type WalletType2 implements Wallet {
    currency: String!
    amount: Float!
    specialField2: String
}

extend type Product @key(fields: "upc") {
    upc: String! @external
}
"#;

pub(crate) const PRODUCTS_SDL: &str = r#"
extend type Query {
    topProducts(first: Int = 5): [Product]
}

extend type Subscription {
    updatedPrice: Product!
    updateProductPrice(upc: String!): Product!
}

type Product @key(fields: "upc") {
    upc: String!
    name: String!
    price: Int!
}
"#;

pub(crate) const REVIEWS_SDL: &str = r#"
type Review {
    body: String!
    author: User!
    product: Product!
}

extend type User @key(fields: "id") {
    id: ID! @external
    username: String! @external
    reviews: [Review]
}

extend type Product @key(fields: "upc") {
    upc: String! @external
    reviews: [Review]
}

extend type Mutation {
    addReview(authorID: String!, upc: String!, review: String!): Review
}

extend type Subscription {
    reviewAdded: Review!
}
"#;

pub(crate) fn supergraph() -> Arc<Supergraph> {
    let subgraphs = [
        ("accounts", ACCOUNTS_SDL),
        ("products", PRODUCTS_SDL),
        ("reviews", REVIEWS_SDL),
    ]
    .into_iter()
    .map(|(name, sdl)| {
        (
            ServiceConfig::new(name, format!("http://{name}.local/graphql")),
            sdl.to_owned(),
        )
    })
    .collect();
    let mut supergraph = compose(subgraphs).expect("fixture subgraphs compose");
    supergraph.version = 1;
    Arc::new(supergraph)
}

pub(crate) fn operation(schema: &Supergraph, query: &str) -> Arc<Operation> {
    Arc::new(Operation::parse(schema, query, None).expect("fixture operation is valid"))
}
