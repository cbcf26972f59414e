mod shmem_backend_tests;
