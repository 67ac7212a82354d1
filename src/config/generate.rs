pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# WEFT CONFIGURATION
# =============================================================================
# Weft captures row changes from two source tables, joins them as they
# change, and keeps the joined documents up to date in a document store.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/weft/config.yml
#   3. /etc/weft/config.yml
#
# Values may reference environment variables as $env{NAME}.

# =============================================================================
# SOURCES
# =============================================================================
# One entry per captured table. The key is the source id; 'table' defaults to
# it. Sources sharing a database path share one connection.

sources:
  customers:
    primary_key: [id]
    connection:
      type: duckdb
      path: ~/.local/share/weft/source.duckdb
    read:
      # Keep polling for new changes after catching up
      follow: true
      poll_interval: 500ms
      batch_size: 500
    retry:
      max_attempts: 5
      initial_backoff: 200ms
      max_backoff: 10s
      timeout: 10s

  orders:
    primary_key: [order_id]
    connection:
      type: duckdb
      path: ~/.local/share/weft/source.duckdb

# =============================================================================
# JOIN
# =============================================================================
# Left-outer join of the 'many' side against the 'one' side. Every many-side
# row produces one document keyed by its primary key. Columns taken from a
# missing one-side row are null.

join:
  many: orders
  one: customers
  # Columns on the many side that hold the one side's primary key
  foreign_key: [customer_id]
  output:
    - { name: order_id, from: many, column: order_id }
    - { name: customer_name, from: one, column: name }
    - { name: customer_email, from: one, column: email }
    - { name: product, from: many, column: product }
    - { name: total_amount, from: many, column: amount }

# =============================================================================
# STATE
# =============================================================================

state:
  # Hash partitions per table in the keyed state store
  partitions: 16

# =============================================================================
# SINK
# =============================================================================
# type: elasticsearch | memory

sink:
  type: elasticsearch
  url: http://localhost:9200
  index: enriched_orders
  # Make each bulk write searchable before it is acknowledged
  refresh: false
  # Flush when this many rows are buffered, or every flush_interval
  batch_size: 500
  flush_interval: 1s
  retry:
    max_attempts: 5
    initial_backoff: 200ms
    max_backoff: 10s
    timeout: 30s

# =============================================================================
# CHECKPOINT
# =============================================================================
# Committed source offsets. Must not be a source database.

checkpoint:
  path: ~/.local/share/weft/offsets.duckdb

# =============================================================================
# PIPELINE
# =============================================================================

pipeline:
  # Capacity of the channels between readers, join and sink
  channel_buffer: 1024

# =============================================================================
# WEB (optional)
# =============================================================================
# Serves /health and /status. Remove this section to disable.

web:
  listen: 127.0.0.1:7200
"#
    .to_string()
}
